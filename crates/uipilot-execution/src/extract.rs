use anyhow::Result;
use regex::Regex;
use tracing::debug;

/// Extract the executable snippet from an oracle response.
///
/// Resolution order:
/// 1. the first fenced block (any language tag is dropped),
/// 2. the contents of a single-line inline span, when the whole response is
///    exactly that span,
/// 3. the whole trimmed response.
pub fn extract_code(response: &str) -> Result<String> {
    let fenced_re = Regex::new(r"(?s)```(?:[\w+-]*[ \t]*\n)?(.*?)```")?;
    if let Some(captures) = fenced_re.captures(response) {
        let code = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        debug!("Extracted fenced code block ({} chars)", code.len());
        return Ok(code.trim().to_string());
    }

    let trimmed = response.trim();
    let inline_re = Regex::new(r"^`([^`\n]+)`$")?;
    if let Some(captures) = inline_re.captures(trimmed) {
        let code = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        return Ok(code.trim().to_string());
    }

    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block_with_language_tag() {
        let response = "Here you go:\n```rhai\nclick(\"#login\");\n```\nDone.";
        assert_eq!(extract_code(response).unwrap(), "click(\"#login\");");
    }

    #[test]
    fn test_first_fenced_block_wins() {
        let response = "```\nfirst();\n```\nand\n```\nsecond();\n```";
        assert_eq!(extract_code(response).unwrap(), "first();");
    }

    #[test]
    fn test_fenced_block_on_one_line() {
        assert_eq!(extract_code("```tap(\"ok\")```").unwrap(), "tap(\"ok\")");
    }

    #[test]
    fn test_sole_inline_span() {
        assert_eq!(extract_code("  `navigate(\"/home\")`  ").unwrap(), "navigate(\"/home\")");
    }

    #[test]
    fn test_inline_span_inside_prose_is_not_extracted() {
        let response = "Call `tap()` then `swipe()`";
        assert_eq!(extract_code(response).unwrap(), response);
    }

    #[test]
    fn test_plain_response_is_trimmed() {
        assert_eq!(extract_code("\n  let x = 1;\n x + 1\n").unwrap(), "let x = 1;\n x + 1");
    }

    #[test]
    fn test_empty_response() {
        assert_eq!(extract_code("   \n").unwrap(), "");
        assert_eq!(extract_code("```\n\n```").unwrap(), "");
    }
}
