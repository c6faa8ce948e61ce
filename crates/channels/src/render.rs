//! Stage content rendering. Placeholder substitution over a fixed token set
//! plus advertising-law decoration of the final body.
//!
//! Tokens are written `{{name}}`. Anything between braces that is not a
//! recognized token is rejected when the campaign is saved, so a typo never
//! reaches a customer's phone as literal text.

use funnel_core::types::{ComplianceFlags, CustomerProfile};
use thiserror::Error;

/// Prefix required on Korean advertising messages.
pub const AD_TAG: &str = "(광고) ";
/// Label preceding the free opt-out contact.
pub const OPT_OUT_LABEL: &str = "무료수신거부";

/// The placeholder tokens a stage template may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    CustomerName,
    CustomerPhone,
    Link,
    PartnerName,
}

impl Placeholder {
    pub const ALL: [Placeholder; 4] = [
        Placeholder::CustomerName,
        Placeholder::CustomerPhone,
        Placeholder::Link,
        Placeholder::PartnerName,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            Placeholder::CustomerName => "customer_name",
            Placeholder::CustomerPhone => "customer_phone",
            Placeholder::Link => "link",
            Placeholder::PartnerName => "partner_name",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.token() == token.trim())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown placeholder {{{{{0}}}}}")]
    UnknownToken(String),

    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    #[error("no value for placeholder {{{{{0}}}}}")]
    Unresolved(&'static str),
}

/// Values available while rendering one message.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub profile: &'a CustomerProfile,
    pub partner_name: &'a str,
}

impl RenderContext<'_> {
    fn value_of(&self, placeholder: Placeholder) -> Option<&str> {
        match placeholder {
            Placeholder::CustomerName => {
                Some(self.profile.name.as_str()).filter(|n| !n.is_empty())
            }
            Placeholder::CustomerPhone => self.profile.phone.as_deref(),
            Placeholder::Link => self.profile.link.as_deref(),
            Placeholder::PartnerName => Some(self.partner_name).filter(|n| !n.is_empty()),
        }
    }
}

enum Segment<'a> {
    Text(&'a str),
    Token(Placeholder),
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, RenderError> {
    let mut segments = Vec::new();
    let mut rest = template;
    let mut offset = 0;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Text(&rest[..open]));
        }
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or(RenderError::Unterminated(offset + open))?;
        let name = &after_open[..close];
        let placeholder = Placeholder::from_token(name)
            .ok_or_else(|| RenderError::UnknownToken(name.trim().to_string()))?;
        segments.push(Segment::Token(placeholder));

        let consumed = open + 2 + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

/// Check a template at write time and return the placeholders it uses.
pub fn validate_template(template: &str) -> Result<Vec<Placeholder>, RenderError> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Token(p) => Some(p),
            Segment::Text(_) => None,
        })
        .collect())
}

/// Substitute every placeholder. A token without a value fails the render
/// rather than leaking the raw token into the sent text.
pub fn render(template: &str, ctx: &RenderContext<'_>) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    for segment in parse(template)? {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Token(p) => {
                let value = ctx.value_of(p).ok_or(RenderError::Unresolved(p.token()))?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}

/// Apply the advertising tag and opt-out footer when the campaign asks for them.
pub fn decorate(body: &str, compliance: &ComplianceFlags) -> String {
    let mut out = String::with_capacity(body.len() + 48);
    if compliance.requires_ad_tag() && !body.starts_with(AD_TAG.trim_end()) {
        out.push_str(AD_TAG);
    }
    out.push_str(body);
    if compliance.requires_opt_out() {
        out.push('\n');
        out.push_str(OPT_OUT_LABEL);
        out.push(' ');
        out.push_str(compliance.opt_out_contact.trim());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> CustomerProfile {
        CustomerProfile::new("c-1", "김민지")
            .with_phone("010-2222-3333")
            .with_link("https://trip.example.com/s/abc")
    }

    #[test]
    fn test_render_substitutes_tokens() {
        let p = profile();
        let ctx = RenderContext {
            profile: &p,
            partner_name: "하나투어 강남",
        };
        let out = render(
            "{{customer_name}}님, {{partner_name}}입니다. 일정표: {{ link }}",
            &ctx,
        )
        .unwrap();
        assert_eq!(
            out,
            "김민지님, 하나투어 강남입니다. 일정표: https://trip.example.com/s/abc"
        );
    }

    #[test]
    fn test_unknown_token_is_rejected() {
        let err = validate_template("안녕하세요 {{nmae}}님").unwrap_err();
        assert_eq!(err, RenderError::UnknownToken("nmae".into()));
    }

    #[test]
    fn test_unterminated_token_is_rejected() {
        assert!(matches!(
            validate_template("링크: {{link"),
            Err(RenderError::Unterminated(_))
        ));
    }

    #[test]
    fn test_missing_value_fails_render() {
        let p = CustomerProfile::new("c-2", "Lee");
        let ctx = RenderContext {
            profile: &p,
            partner_name: "agency",
        };
        assert_eq!(
            render("see {{link}}", &ctx),
            Err(RenderError::Unresolved("link"))
        );
    }

    #[test]
    fn test_plain_text_passes_through() {
        let p = profile();
        let ctx = RenderContext {
            profile: &p,
            partner_name: "agency",
        };
        assert_eq!(render("no tokens here", &ctx).unwrap(), "no tokens here");
        assert!(validate_template("").unwrap().is_empty());
    }

    #[test]
    fn test_decorate_advertisement() {
        let flags = ComplianceFlags {
            is_advertisement: true,
            auto_append_ad_tag: true,
            auto_append_opt_out: true,
            opt_out_contact: "080-123-4567".into(),
        };
        assert_eq!(
            decorate("봄 특가 안내", &flags),
            "(광고) 봄 특가 안내\n무료수신거부 080-123-4567"
        );
    }

    #[test]
    fn test_decorate_leaves_informational_messages_alone() {
        let flags = ComplianceFlags::default();
        assert_eq!(decorate("출발 안내", &flags), "출발 안내");
    }
}
