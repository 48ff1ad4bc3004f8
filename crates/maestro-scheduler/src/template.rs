//! `{{variable}}` prompt template rendering.

use std::collections::BTreeMap;

use crate::error::{SchedulerError, SchedulerResult};

/// Substitute every `{{name}}` occurrence with its variable value.
///
/// Whitespace inside the braces is tolerated (`{{ env }}`). A placeholder
/// with no matching variable is an error — a task must never run with a
/// half-rendered prompt.
pub fn render_template(
    template: &str,
    variables: &BTreeMap<String, String>,
) -> SchedulerResult<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // An unclosed brace is literal text.
            rendered.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after[..end].trim();
        let value = variables
            .get(name)
            .ok_or_else(|| SchedulerError::MissingVariable(name.to_string()))?;
        rendered.push_str(value);
        rest = &after[end + 2..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn substitutes_all_occurrences() {
        let rendered = render_template(
            "Check {{env}} and report {{env}} status to {{channel}}",
            &vars(&[("env", "prod"), ("channel", "#ops")]),
        )
        .expect("render");
        assert_eq!(rendered, "Check prod and report prod status to #ops");
    }

    #[test]
    fn tolerates_inner_whitespace() {
        let rendered =
            render_template("Check {{ env }}", &vars(&[("env", "staging")])).expect("render");
        assert_eq!(rendered, "Check staging");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let err = render_template("Check {{env}}", &vars(&[])).unwrap_err();
        assert!(matches!(err, SchedulerError::MissingVariable(name) if name == "env"));
    }

    #[test]
    fn template_without_placeholders_is_unchanged() {
        let rendered = render_template("just text", &vars(&[])).expect("render");
        assert_eq!(rendered, "just text");
    }

    #[test]
    fn unclosed_braces_are_literal() {
        let rendered = render_template("odd {{unclosed", &vars(&[])).expect("render");
        assert_eq!(rendered, "odd {{unclosed");
    }
}
