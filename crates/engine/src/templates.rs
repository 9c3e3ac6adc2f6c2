//! `<<expr>>` placeholder parsing and unresolved-template diagnostics.

use serde::Serialize;
use toolflow_types::{StepConfig, ToolStep};

use crate::context::VariableContext;
use crate::resolve::ExpressionResolver;

const OPEN: &str = "<<";
const CLOSE: &str = ">>";

/// A piece of a template string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSegment<'a> {
    Literal(&'a str),
    /// Trimmed expression between the delimiters.
    Placeholder(&'a str),
}

/// Splits `template` into literal text and placeholders.
///
/// A placeholder ends at the first `>>` after its `<<`. An unterminated `<<` and everything after
/// it is literal text.
pub fn parse_template(template: &str) -> Vec<TemplateSegment<'_>> {
    let mut segments = Vec::new();
    let mut remainder = template;

    while let Some(start) = remainder.find(OPEN) {
        let after_open = &remainder[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        if start > 0 {
            segments.push(TemplateSegment::Literal(&remainder[..start]));
        }
        segments.push(TemplateSegment::Placeholder(after_open[..end].trim()));
        remainder = &after_open[end + CLOSE.len()..];
    }

    if !remainder.is_empty() {
        segments.push(TemplateSegment::Literal(remainder));
    }
    segments
}

/// Expressions of every placeholder in `template`, without delimiters.
pub fn extract_template_expressions(template: &str) -> Vec<&str> {
    parse_template(template)
        .into_iter()
        .filter_map(|segment| match segment {
            TemplateSegment::Placeholder(expression) => Some(expression),
            TemplateSegment::Literal(_) => None,
        })
        .collect()
}

/// When `template` is exactly one placeholder, its expression.
pub fn sole_placeholder(template: &str) -> Option<&str> {
    match parse_template(template.trim()).as_slice() {
        [TemplateSegment::Placeholder(expression)] => Some(*expression),
        _ => None,
    }
}

/// Structured unresolved template reference diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedTemplateRef {
    /// JSON pointer of the field, relative to the step.
    pub source_path: String,
    /// Raw expression without delimiters.
    pub expression: String,
    pub error_code: &'static str,
    pub message: String,
}

/// Lists every placeholder of a request step that fails to resolve against `context`.
///
/// Transform steps carry no placeholders and always yield an empty list.
pub fn collect_unresolved_templates(
    step: &ToolStep,
    context: &VariableContext,
    resolver: &ExpressionResolver,
) -> Vec<UnresolvedTemplateRef> {
    let StepConfig::Request(request) = &step.config else {
        return Vec::new();
    };

    let mut fields: Vec<(String, &str)> = vec![("/config/url".to_string(), request.url.as_str())];
    for (name, value) in &request.headers {
        fields.push((format!("/config/headers/{}", escape_pointer_token(name)), value));
    }
    for (name, value) in &request.query_params {
        fields.push((format!("/config/queryParams/{}", escape_pointer_token(name)), value));
    }
    if let Some(body) = &request.body {
        fields.push(("/config/body".to_string(), body));
    }

    let mut unresolved = Vec::new();
    for (source_path, template) in fields {
        for expression in extract_template_expressions(template) {
            if let Err(error) = resolver.evaluate(expression, context) {
                unresolved.push(UnresolvedTemplateRef {
                    source_path: source_path.clone(),
                    expression: expression.to_string(),
                    error_code: error.error_code(),
                    message: error.to_string(),
                });
            }
        }
    }
    unresolved
}

fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolflow_types::{RequestStepConfig, TransformStepConfig};

    #[test]
    fn parses_literals_and_placeholders() {
        assert_eq!(
            parse_template("Bearer << token >>!"),
            vec![
                TemplateSegment::Literal("Bearer "),
                TemplateSegment::Placeholder("token"),
                TemplateSegment::Literal("!")
            ]
        );
        assert_eq!(parse_template("a << b"), vec![TemplateSegment::Literal("a << b")]);
        assert!(parse_template("").is_empty());
    }

    #[test]
    fn extracts_function_expressions() {
        let template = "https://api/<<(ctx) => ctx.user.id>>/items?x=<<page>>";
        assert_eq!(extract_template_expressions(template), vec!["(ctx) => ctx.user.id", "page"]);
        assert_eq!(sole_placeholder(" <<page>> "), Some("page"));
        assert_eq!(sole_placeholder("p<<page>>"), None);
    }

    #[test]
    fn collects_unresolved_request_fields() {
        let mut request = RequestStepConfig {
            system_id: "crm".into(),
            url: "https://crm.example.com/<<accountId>>".into(),
            body: Some(r#"{"id": <<(ctx) => ctx.missing.id>>}"#.into()),
            ..Default::default()
        };
        request.headers.insert("X-Token".into(), "<<crm_token>>".into());
        let step = ToolStep {
            id: "fetch".into(),
            config: StepConfig::Request(request),
            data_selector: None,
            instruction: None,
            modify: false,
            failure_behavior: Default::default(),
        };
        let context = VariableContext::from_json(json!({"crm_token": "t"})).expect("object");
        let resolver = ExpressionResolver::default();

        let unresolved = collect_unresolved_templates(&step, &context, &resolver);
        let paths: Vec<&str> = unresolved.iter().map(|entry| entry.source_path.as_str()).collect();
        assert_eq!(paths, vec!["/config/url", "/config/body"]);
        assert!(unresolved.iter().all(|entry| entry.error_code == "RESOLUTION_FAILED"));
        assert!(unresolved[0].message.contains("Available keys: crm_token"));

        let transform = ToolStep {
            id: "t".into(),
            config: StepConfig::Transform(TransformStepConfig {
                transform_code: "(ctx) => ctx.missing".into(),
            }),
            data_selector: None,
            instruction: None,
            modify: false,
            failure_behavior: Default::default(),
        };
        assert!(collect_unresolved_templates(&transform, &context, &resolver).is_empty());
    }
}
