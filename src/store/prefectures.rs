//! Prefecture master (JIS X 0401 codes) and the name → code lookup used to
//! resolve observations.

use anyhow::Result;
use sqlite::State;
use std::collections::HashMap;

use super::{SharedDb, lock};
use crate::telegram::fields::prefecture_of_area;

const PREFECTURES: &[(&str, &str)] = &[
    ("01", "北海道"),
    ("02", "青森県"),
    ("03", "岩手県"),
    ("04", "宮城県"),
    ("05", "秋田県"),
    ("06", "山形県"),
    ("07", "福島県"),
    ("08", "茨城県"),
    ("09", "栃木県"),
    ("10", "群馬県"),
    ("11", "埼玉県"),
    ("12", "千葉県"),
    ("13", "東京都"),
    ("14", "神奈川県"),
    ("15", "新潟県"),
    ("16", "富山県"),
    ("17", "石川県"),
    ("18", "福井県"),
    ("19", "山梨県"),
    ("20", "長野県"),
    ("21", "岐阜県"),
    ("22", "静岡県"),
    ("23", "愛知県"),
    ("24", "三重県"),
    ("25", "滋賀県"),
    ("26", "京都府"),
    ("27", "大阪府"),
    ("28", "兵庫県"),
    ("29", "奈良県"),
    ("30", "和歌山県"),
    ("31", "鳥取県"),
    ("32", "島根県"),
    ("33", "岡山県"),
    ("34", "広島県"),
    ("35", "山口県"),
    ("36", "徳島県"),
    ("37", "香川県"),
    ("38", "愛媛県"),
    ("39", "高知県"),
    ("40", "福岡県"),
    ("41", "佐賀県"),
    ("42", "長崎県"),
    ("43", "熊本県"),
    ("44", "大分県"),
    ("45", "宮崎県"),
    ("46", "鹿児島県"),
    ("47", "沖縄県"),
];

pub(super) fn seed(conn: &sqlite::Connection) -> Result<()> {
    let mut stmt = conn.prepare("INSERT OR IGNORE INTO prefectures (code, name) VALUES (?, ?)")?;
    for (code, name) in PREFECTURES {
        stmt.reset()?;
        stmt.bind((1, *code))?;
        stmt.bind((2, *name))?;
        stmt.next()?;
    }
    Ok(())
}

/// Name → code lookup.  Built explicitly from the `prefectures` table and
/// passed to whoever needs it; callers reload it once per fetch cycle.
#[derive(Debug, Clone, Default)]
pub struct PrefectureMaster {
    by_name: HashMap<String, String>,
}

impl PrefectureMaster {
    pub fn load(db: &SharedDb) -> Result<Self> {
        let conn = lock(db)?;
        let mut stmt = conn.prepare("SELECT code, name FROM prefectures")?;
        let mut pairs = Vec::new();
        while let State::Row = stmt.next()? {
            pairs.push((stmt.read::<String, _>(0)?, stmt.read::<String, _>(1)?));
        }
        Ok(Self::from_pairs(pairs))
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut by_name = HashMap::new();
        for (code, name) in pairs {
            if let Some(bare) = bare_name(&name) {
                by_name.entry(bare).or_insert_with(|| code.clone());
            }
            by_name.insert(name, code);
        }
        Self { by_name }
    }

    /// Resolve a full name (`東京都`), a bare name (`東京`) or an area name
    /// with a prefecture prefix (`石川県能登`).
    pub fn code_for(&self, name: &str) -> Option<&str> {
        let name = name.trim();
        self.by_name
            .get(name)
            .or_else(|| self.by_name.get(&prefecture_of_area(name)))
            .map(String::as_str)
    }

    /// Canonical name for a code, for display.
    pub fn name_for(&self, code: &str) -> Option<&str> {
        self.by_name
            .iter()
            .filter(|(_, c)| c.as_str() == code)
            .map(|(n, _)| n.as_str())
            .max_by_key(|n| n.chars().count())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}

/// `東京都` → `東京`; `北海道` stays whole.
fn bare_name(name: &str) -> Option<String> {
    if name == "北海道" {
        return None;
    }
    name.strip_suffix(['都', '府', '県'])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
