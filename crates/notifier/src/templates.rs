//! Message templates.
//!
//! Templates are plain strings with `{{field}}` placeholders filled from a
//! [`RenderContext`]. A kind without its own template uses the default one.
//! Templates can be loaded from a JSON file:
//!
//! ```json
//! {
//!   "default": { "subject": "...", "text": "...", "html": "..." },
//!   "kinds":   { "password-reset": { "subject": "...", "text": "...", "html": "..." } }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use courier_common::types::{Delivery, NotificationOptions};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown template field '{0}'")]
    UnknownField(String),

    #[error("unterminated placeholder in template")]
    Unterminated,

    #[error("notification has neither a text nor an html body")]
    EmptyBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Template {
    pub subject: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
}

/// Values available to templates, built from an unmasked delivery.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    fields: BTreeMap<&'static str, String>,
    has_text: bool,
    has_html: bool,
}

impl RenderContext {
    pub fn new(delivery: &Delivery, options: &NotificationOptions, email: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("subject", options.subject.clone());
        fields.insert("text", options.text.clone());
        fields.insert("html", options.html.clone());
        fields.insert("kind_id", options.kind_id.clone());
        fields.insert("kind_description", options.kind_description.clone());
        fields.insert("source_description", options.source_description.clone());
        fields.insert("endorsement", options.endorsement.clone());
        fields.insert("reply_to", options.reply_to.clone());
        fields.insert("to", email.to_string());
        fields.insert("user_guid", delivery.user_guid.clone().unwrap_or_default());
        fields.insert("space", delivery.space.name.clone());
        fields.insert("organization", delivery.organization.name.clone());
        fields.insert("client_id", delivery.client_id.clone());
        fields.insert("scope", delivery.scope.clone());
        fields.insert("message_id", delivery.message_id.clone());

        Self {
            fields,
            has_text: !options.text.is_empty(),
            has_html: !options.html.is_empty(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Render message content for a kind.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        kind_id: &str,
        context: &RenderContext,
    ) -> Result<RenderedMessage, RenderError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct Templates {
    default: Template,
    #[serde(default)]
    kinds: HashMap<String, Template>,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            default: Template {
                subject: "CF Notification: {{subject}}".to_string(),
                text: "{{text}}\n\n{{endorsement}}".to_string(),
                html: "<p>{{endorsement}}</p>{{html}}".to_string(),
            },
            kinds: HashMap::new(),
        }
    }
}

impl Templates {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let templates: Templates = serde_json::from_str(&raw)?;
        tracing::info!(
            path = %path.as_ref().display(),
            kinds = templates.kinds.len(),
            "Loaded templates"
        );
        Ok(templates)
    }

    pub fn with_kind(mut self, kind_id: impl Into<String>, template: Template) -> Self {
        self.kinds.insert(kind_id.into(), template);
        self
    }

    fn template_for(&self, kind_id: &str) -> &Template {
        self.kinds.get(kind_id).unwrap_or(&self.default)
    }
}

#[async_trait]
impl TemplateRenderer for Templates {
    async fn render(
        &self,
        kind_id: &str,
        context: &RenderContext,
    ) -> Result<RenderedMessage, RenderError> {
        if !context.has_text && !context.has_html {
            return Err(RenderError::EmptyBody);
        }

        let template = self.template_for(kind_id);
        let subject = fill(&template.subject, context)?;
        let text = if context.has_text {
            Some(fill(&template.text, context)?)
        } else {
            None
        };
        let html = if context.has_html {
            Some(fill(&template.html, context)?)
        } else {
            None
        };

        Ok(RenderedMessage {
            subject,
            text,
            html,
        })
    }
}

/// Replace every `{{ name }}` with the context value.
fn fill(template: &str, context: &RenderContext) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(RenderError::Unterminated)?;
        let name = after[..end].trim();
        let value = context
            .get(name)
            .ok_or_else(|| RenderError::UnknownField(name.to_string()))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_common::types::{Organization, Space};

    use super::*;

    fn delivery() -> Delivery {
        Delivery {
            message_id: "m-1".into(),
            options: NotificationOptions::default(),
            user_guid: Some("user-1".into()),
            email: None,
            space: Space {
                guid: "s-1".into(),
                name: "dev".into(),
                organization_guid: "o-1".into(),
            },
            organization: Organization {
                guid: "o-1".into(),
                name: "acme".into(),
            },
            client_id: "the-client".into(),
            scope: String::new(),
            correlation_id: "req-1".into(),
            request_received: Utc::now(),
        }
    }

    fn options(text: &str, html: &str) -> NotificationOptions {
        NotificationOptions {
            kind_id: "the-kind".into(),
            subject: "Hello".into(),
            text: text.into(),
            html: html.into(),
            endorsement: "Sent to you.".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_default_template_renders_both_parts() {
        let ctx = RenderContext::new(&delivery(), &options("body", "<b>body</b>"), "a@example.com");
        let rendered = Templates::default().render("the-kind", &ctx).await.unwrap();

        assert_eq!(rendered.subject, "CF Notification: Hello");
        assert_eq!(rendered.text.as_deref(), Some("body\n\nSent to you."));
        assert_eq!(rendered.html.as_deref(), Some("<p>Sent to you.</p><b>body</b>"));
    }

    #[tokio::test]
    async fn test_missing_part_is_omitted() {
        let ctx = RenderContext::new(&delivery(), &options("only text", ""), "a@example.com");
        let rendered = Templates::default().render("the-kind", &ctx).await.unwrap();

        assert!(rendered.text.is_some());
        assert!(rendered.html.is_none());
    }

    #[tokio::test]
    async fn test_kind_template_overrides_default() {
        let templates = Templates::default().with_kind(
            "the-kind",
            Template {
                subject: "[{{organization}}/{{ space }}] {{subject}}".into(),
                text: "{{text}} for {{to}}".into(),
                html: String::new(),
            },
        );
        let ctx = RenderContext::new(&delivery(), &options("hi", ""), "a@example.com");
        let rendered = templates.render("the-kind", &ctx).await.unwrap();

        assert_eq!(rendered.subject, "[acme/dev] Hello");
        assert_eq!(rendered.text.as_deref(), Some("hi for a@example.com"));
    }

    #[tokio::test]
    async fn test_unknown_field_fails() {
        let templates = Templates::default().with_kind(
            "broken",
            Template {
                subject: "{{nope}}".into(),
                ..Default::default()
            },
        );
        let ctx = RenderContext::new(&delivery(), &options("hi", ""), "a@example.com");

        assert_eq!(
            templates.render("broken", &ctx).await,
            Err(RenderError::UnknownField("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_unterminated_placeholder_fails() {
        let templates = Templates::default().with_kind(
            "broken",
            Template {
                subject: "{{subject".into(),
                ..Default::default()
            },
        );
        let ctx = RenderContext::new(&delivery(), &options("hi", ""), "a@example.com");

        assert_eq!(
            templates.render("broken", &ctx).await,
            Err(RenderError::Unterminated)
        );
    }

    #[tokio::test]
    async fn test_empty_body_fails() {
        let ctx = RenderContext::new(&delivery(), &options("", ""), "a@example.com");
        assert_eq!(
            Templates::default().render("the-kind", &ctx).await,
            Err(RenderError::EmptyBody)
        );
    }

    #[test]
    fn test_templates_deserialize_from_json() {
        let templates: Templates = serde_json::from_value(serde_json::json!({
            "default": {"subject": "{{subject}}", "text": "{{text}}", "html": "{{html}}"},
            "kinds": {"k": {"subject": "K: {{subject}}"}}
        }))
        .unwrap();

        assert_eq!(templates.template_for("k").subject, "K: {{subject}}");
        assert_eq!(templates.template_for("other").subject, "{{subject}}");
    }
}
