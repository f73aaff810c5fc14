//! Message templates with `{{field}}` placeholders.
//!
//! Rendering is strict: a placeholder whose field is missing from the payload
//! is an error, so a broken template never reaches an inbox half-filled.

use std::collections::HashMap;

use rosterbell_core::error::{Result, RosterbellError};
use rosterbell_core::types::{NotificationKind, Payload};

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct Template {
    pub subject: String,
    pub body: String,
}

impl Template {
    pub fn new(subject: &str, body: &str) -> Self {
        Self {
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }
}

/// Templates by id. Jobs reference templates by id, defaulting to their kind.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Template>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a template for every notification kind.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            NotificationKind::Reminder.as_str(),
            Template::new(
                "You have {{pending_count}} leave request(s) awaiting approval",
                "Hi {{recipient_name}},\n\n\
                 The following leave requests are waiting for your decision:\n\n\
                 {{items}}\n\n\
                 Please review them in the HR portal.",
            ),
        );
        registry.register(
            NotificationKind::Overdue.as_str(),
            Template::new(
                "Timesheet overdue: {{overdue_count}} period(s) not submitted",
                "Hi {{recipient_name}},\n\n\
                 These timesheets are past their period end and still in draft:\n\n\
                 {{items}}\n\n\
                 Please submit them as soon as possible.",
            ),
        );
        registry.register(
            NotificationKind::Escalation.as_str(),
            Template::new(
                "Escalation: {{stale_count}} leave request(s) pending over {{threshold_days}} days",
                "Hi {{recipient_name}},\n\n\
                 These leave requests have waited longer than {{threshold_days}} days \
                 (oldest: {{oldest_days}} days):\n\n\
                 {{items}}\n\n\
                 Please follow up with the approvers.",
            ),
        );
        registry.register(
            NotificationKind::DigestDaily.as_str(),
            Template::new(
                "Daily HR digest for {{date}}",
                "Hi {{recipient_name}},\n\n\
                 Pending approvals: {{pending_approvals}}\n\
                 {{approval_items}}\n\n\
                 Team timesheets overdue: {{team_overdue_timesheets}}\n\
                 {{timesheet_items}}",
            ),
        );
        registry.register(
            NotificationKind::DigestWeekly.as_str(),
            Template::new(
                "Weekly HR summary {{week_start}} to {{week_end}}",
                "Hi {{recipient_name}},\n\n\
                 Leave approved this week: {{approved_leave}}\n\
                 Leave still pending: {{pending_leave}}\n\
                 Overdue timesheets: {{overdue_timesheets}}",
            ),
        );
        registry
    }

    pub fn register(&mut self, id: &str, template: Template) {
        self.templates.insert(id.to_string(), template);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }

    pub fn render(&self, id: &str, payload: &Payload) -> Result<RenderedMessage> {
        let template = self
            .templates
            .get(id)
            .ok_or_else(|| RosterbellError::Template(format!("Unknown template '{id}'")))?;
        Ok(RenderedMessage {
            subject: render_str(&template.subject, payload)
                .map_err(|e| RosterbellError::Template(format!("{id} subject: {e}")))?,
            body: render_str(&template.body, payload)
                .map_err(|e| RosterbellError::Template(format!("{id} body: {e}")))?,
        })
    }
}

/// Substitute `{{name}}` placeholders. Whitespace inside braces is ignored.
fn render_str(source: &str, payload: &Payload) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| "unclosed placeholder".to_string())?;
        let key = after[..end].trim();
        let value = payload
            .get(key)
            .ok_or_else(|| format!("missing field '{key}'"))?;
        out.push_str(&value.to_string());
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
