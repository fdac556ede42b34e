//! Legacy option stripping for dependency schema files

use regex::Regex;

use crate::error::{CodegenError, Result};

/// Drops every line that mentions one of the configured legacy options
#[derive(Debug, Clone)]
pub struct Sanitizer {
    options: Vec<(String, Regex)>,
}

/// Result of sanitizing one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub content: String,
    /// Options that caused at least one line to be dropped
    pub stripped: Vec<String>,
}

impl Sanitized {
    pub fn changed(&self) -> bool {
        !self.stripped.is_empty()
    }
}

impl Sanitizer {
    pub fn new(options: &[String]) -> Result<Self> {
        let options = options
            .iter()
            .map(|option| {
                let pattern = format!(r"\b{}\b", regex::escape(option));
                Regex::new(&pattern)
                    .map(|re| (option.clone(), re))
                    .map_err(|e| CodegenError::InvalidConfig(format!("strip option '{}': {}", option, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { options })
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Remove offending lines. Content without any match is returned as-is.
    pub fn sanitize(&self, content: &str) -> Sanitized {
        let mut stripped: Vec<String> = Vec::new();
        let mut kept = Vec::new();

        for line in content.lines() {
            let hit = self.options.iter().find(|(_, re)| re.is_match(line));
            match hit {
                Some((option, _)) => {
                    if !stripped.contains(option) {
                        stripped.push(option.clone());
                    }
                }
                None => kept.push(line),
            }
        }

        if stripped.is_empty() {
            return Sanitized {
                content: content.to_string(),
                stripped,
            };
        }

        let mut content = kept.join("\n");
        content.push('\n');
        Sanitized { content, stripped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> Sanitizer {
        Sanitizer::new(&["java_generic_services".to_string()]).unwrap()
    }

    #[test]
    fn test_strips_option_line() {
        let input = "syntax = \"proto2\";\noption java_generic_services = true;\nmessage A {}\n";
        let result = sanitizer().sanitize(input);

        assert!(result.changed());
        assert_eq!(result.stripped, vec!["java_generic_services"]);
        assert_eq!(result.content, "syntax = \"proto2\";\nmessage A {}\n");
    }

    #[test]
    fn test_untouched_content_is_identical() {
        let input = "syntax = \"proto3\";\r\nmessage A {}";
        let result = sanitizer().sanitize(input);

        assert!(!result.changed());
        assert_eq!(result.content, input);
    }

    #[test]
    fn test_word_boundary() {
        let input = "option my_java_generic_services_flag = 1;\n";
        assert!(!sanitizer().sanitize(input).changed());
    }
}
