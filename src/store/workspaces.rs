//! Read-only access to workspace configuration: conditions, channels,
//! departments, templates and sealed credentials.  These rows are managed
//! by the admin side; this crate never writes them outside tests.

use anyhow::{Context, Result};
use sqlite::State;

use super::{SharedDb, lock};
use crate::crypto::SealedSecret;

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationCondition {
    pub id: i64,
    pub workspace_id: i64,
    /// Intensity floor as stored (label such as `5弱`, or a number).
    pub min_intensity: String,
    pub info_subtype: Option<String>,
    /// Prefecture codes or names; empty means every prefecture.
    pub target_prefectures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub channel_id: String,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: i64,
    pub name: String,
    pub bot_token: Option<SealedSecret>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Department {
    pub id: i64,
    pub name: String,
    pub emoji: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    pub title: String,
    pub body: String,
}

/// Enabled conditions of active workspaces.
pub fn enabled_conditions(db: &SharedDb) -> Result<Vec<NotificationCondition>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "SELECT c.id, c.workspace_id, c.min_intensity, c.info_subtype, c.target_prefectures
         FROM notification_conditions c
         JOIN workspaces w ON w.id = c.workspace_id
         WHERE c.is_enabled = 1 AND w.is_active = 1
         ORDER BY c.id",
    )?;
    let mut out = Vec::new();
    while let State::Row = stmt.next()? {
        let id = stmt.read::<i64, _>(0)?;
        let targets = stmt.read::<String, _>(4)?;
        let target_prefectures: Vec<String> = serde_json::from_str(&targets)
            .with_context(|| format!("condition {id}: target_prefectures is not a JSON string array"))?;
        out.push(NotificationCondition {
            id,
            workspace_id: stmt.read::<i64, _>(1)?,
            min_intensity: stmt.read::<String, _>(2)?,
            info_subtype: stmt
                .read::<Option<String>, _>(3)?
                .filter(|s| !s.trim().is_empty()),
            target_prefectures,
        });
    }
    Ok(out)
}

pub fn enabled_channels(db: &SharedDb, workspace_id: i64, purpose: &str) -> Result<Vec<Channel>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "SELECT channel_id FROM notification_channels
         WHERE workspace_id = ? AND purpose = ? AND is_enabled = 1
         ORDER BY id",
    )?;
    stmt.bind((1, workspace_id))?;
    stmt.bind((2, purpose))?;
    let mut out = Vec::new();
    while let State::Row = stmt.next()? {
        out.push(Channel {
            channel_id: stmt.read::<String, _>(0)?,
        });
    }
    Ok(out)
}

pub fn workspace(db: &SharedDb, id: i64) -> Result<Option<Workspace>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "SELECT id, name, bot_token_ciphertext, bot_token_iv, bot_token_tag
         FROM workspaces WHERE id = ?",
    )?;
    stmt.bind((1, id))?;
    if let State::Done = stmt.next()? {
        return Ok(None);
    }
    let sealed = match (
        stmt.read::<Option<String>, _>(2)?,
        stmt.read::<Option<String>, _>(3)?,
        stmt.read::<Option<String>, _>(4)?,
    ) {
        (Some(ciphertext), Some(iv), Some(auth_tag)) => Some(SealedSecret {
            ciphertext,
            iv,
            auth_tag,
        }),
        _ => None,
    };
    Ok(Some(Workspace {
        id: stmt.read::<i64, _>(0)?,
        name: stmt.read::<String, _>(1)?,
        bot_token: sealed,
    }))
}

pub fn active_departments(db: &SharedDb, workspace_id: i64) -> Result<Vec<Department>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "SELECT id, name, emoji FROM departments
         WHERE workspace_id = ? AND is_active = 1
         ORDER BY sort_order, id",
    )?;
    stmt.bind((1, workspace_id))?;
    let mut out = Vec::new();
    while let State::Row = stmt.next()? {
        out.push(Department {
            id: stmt.read::<i64, _>(0)?,
            name: stmt.read::<String, _>(1)?,
            emoji: stmt.read::<Option<String>, _>(2)?,
        });
    }
    Ok(out)
}

pub fn active_template(db: &SharedDb, workspace_id: i64) -> Result<Option<MessageTemplate>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "SELECT title, body FROM message_templates
         WHERE workspace_id = ? AND is_active = 1
         ORDER BY id DESC LIMIT 1",
    )?;
    stmt.bind((1, workspace_id))?;
    match stmt.next()? {
        State::Row => Ok(Some(MessageTemplate {
            title: stmt.read::<String, _>(0)?,
            body: stmt.read::<String, _>(1)?,
        })),
        State::Done => Ok(None),
    }
}

/// Most recently updated active upstream key for `provider`.
pub fn active_api_credential(db: &SharedDb, provider: &str) -> Result<Option<SealedSecret>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "SELECT ciphertext, iv, auth_tag FROM api_credentials
         WHERE provider = ? AND is_active = 1
         ORDER BY updated_at DESC, id DESC LIMIT 1",
    )?;
    stmt.bind((1, provider))?;
    match stmt.next()? {
        State::Row => Ok(Some(SealedSecret {
            ciphertext: stmt.read::<String, _>(0)?,
            iv: stmt.read::<String, _>(1)?,
            auth_tag: stmt.read::<String, _>(2)?,
        })),
        State::Done => Ok(None),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encrypt, test_key};
    use crate::store::open_memory;

    #[test]
    fn conditions_of_inactive_workspaces_are_skipped() {
        let db = open_memory();
        fixtures::workspace(&db, 1, None);
        fixtures::workspace(&db, 2, None);
        lock(&db)
            .unwrap()
            .execute("UPDATE workspaces SET is_active = 0 WHERE id = 2")
            .unwrap();
        fixtures::condition(&db, 1, "5弱", None, &["13", "14"]);
        fixtures::condition(&db, 2, "1", None, &[]);

        let conds = enabled_conditions(&db).unwrap();
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].target_prefectures, vec!["13", "14"]);
        assert_eq!(conds[0].info_subtype, None);
    }

    #[test]
    fn channels_filter_by_purpose() {
        let db = open_memory();
        fixtures::workspace(&db, 1, None);
        fixtures::channel(&db, 1, "C-prod", "earthquake");
        fixtures::channel(&db, 1, "C-drill", "training");
        let chans = enabled_channels(&db, 1, "earthquake").unwrap();
        assert_eq!(chans.len(), 1);
        assert_eq!(chans[0].channel_id, "C-prod");
    }

    #[test]
    fn workspace_token_and_ordered_departments() {
        let db = open_memory();
        let sealed = encrypt(&test_key(9), "xoxb-1").unwrap();
        fixtures::workspace(&db, 1, Some(&sealed));
        fixtures::workspace(&db, 2, None);
        fixtures::department(&db, 1, 10, "総務", 2);
        fixtures::department(&db, 1, 11, "情報システム", 1);

        assert_eq!(workspace(&db, 1).unwrap().unwrap().bot_token, Some(sealed));
        assert_eq!(workspace(&db, 2).unwrap().unwrap().bot_token, None);
        assert!(workspace(&db, 3).unwrap().is_none());
        let names: Vec<_> = active_departments(&db, 1)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["情報システム", "総務"]);
        assert!(active_template(&db, 1).unwrap().is_none());
    }
}
