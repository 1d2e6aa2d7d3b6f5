//! Message templates and the interactive block layout.

use chrono::{DateTime, FixedOffset};
use serde_json::{Value, json};

use crate::intensity::INVESTIGATING;
use crate::store::workspaces::{Department, MessageTemplate};
use crate::telegram::EarthquakeInfo;

pub const UNKNOWN: &str = "不明";

/// Slack allows at most 25 elements per actions block.
const BUTTONS_PER_BLOCK: usize = 25;

pub fn default_template() -> MessageTemplate {
    MessageTemplate {
        title: "【地震情報】{{epicenter}}で最大震度{{maxIntensity}}".into(),
        body: "*{{title}}*\n\
               発生時刻: {{occurrenceTime}}\n\
               震源地: {{epicenter}}\n\
               最大震度: {{maxIntensity}}\n\
               マグニチュード: {{magnitude}}\n\
               深さ: {{depth}}\n\n\
               各部署は状況を確認し、下のボタンから応答してください。"
            .into(),
    }
}

/// Placeholder values for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Values {
    pub epicenter: String,
    pub max_intensity: String,
    pub magnitude: String,
    pub depth: String,
    pub occurrence_time: String,
    pub title: String,
}

impl Values {
    pub fn from_info(info: &EarthquakeInfo) -> Self {
        Self {
            epicenter: info.epicenter.clone().unwrap_or_else(|| UNKNOWN.into()),
            max_intensity: info
                .max_intensity
                .clone()
                .unwrap_or_else(|| INVESTIGATING.into()),
            magnitude: info
                .magnitude
                .map(|m| format!("M{m:.1}"))
                .unwrap_or_else(|| UNKNOWN.into()),
            depth: info
                .depth
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_else(|| UNKNOWN.into()),
            occurrence_time: info
                .occurred_at
                .map(format_jst)
                .unwrap_or_else(|| UNKNOWN.into()),
            title: info.title.clone().unwrap_or_else(|| "地震情報".into()),
        }
    }

    fn get(&self, name: &str) -> Option<&str> {
        Some(match name {
            "epicenter" => &self.epicenter,
            "maxIntensity" => &self.max_intensity,
            "magnitude" => &self.magnitude,
            "depth" => &self.depth,
            "occurrenceTime" => &self.occurrence_time,
            "title" => &self.title,
            _ => return None,
        })
    }
}

fn format_jst(t: DateTime<FixedOffset>) -> String {
    match FixedOffset::east_opt(9 * 3600) {
        Some(jst) => t.with_timezone(&jst).format("%Y年%m月%d日 %H時%M分").to_string(),
        None => t.to_rfc3339(),
    }
}

/// Substitute `{{name}}` placeholders.  Unknown names are left in place.
pub fn render(template: &str, values: &Values) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match values.get(name) {
                    Some(v) => out.push_str(v),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Header, body section and one button per department.
pub fn blocks(title: &str, body: &str, departments: &[Department], notification_id: i64) -> Value {
    let mut blocks = vec![
        json!({ "type": "header", "text": { "type": "plain_text", "text": title, "emoji": true } }),
        json!({ "type": "section", "text": { "type": "mrkdwn", "text": body } }),
    ];
    for chunk in departments.chunks(BUTTONS_PER_BLOCK) {
        let buttons: Vec<Value> = chunk
            .iter()
            .map(|d| {
                let label = match &d.emoji {
                    Some(e) if !e.is_empty() => format!("{e} {}", d.name),
                    _ => d.name.clone(),
                };
                json!({
                    "type": "button",
                    "text": { "type": "plain_text", "text": label, "emoji": true },
                    "action_id": format!("department_{}", d.id),
                    "value": json!({ "departmentId": d.id, "notificationId": notification_id }).to_string(),
                })
            })
            .collect();
        blocks.push(json!({ "type": "actions", "elements": buttons }));
    }
    Value::Array(blocks)
}
