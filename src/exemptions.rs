use regex::Regex;
use tracing::warn;

/// A single exemption rule: the raw string for whole-image equality, plus the
/// compiled pattern when the string parses as a regex. Rules that are neither
/// are skipped at match time.
pub struct ExemptionRule {
    raw: String,
    pattern: Option<Regex>,
}

pub struct Exemptions {
    rules: Vec<ExemptionRule>,
}

impl Exemptions {
    pub fn compile(entries: &[String]) -> Self {
        let rules = entries
            .iter()
            .map(|raw| {
                let pattern = match Regex::new(raw) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(
                            exemption = %raw,
                            "exemption does not compile as a regex, keeping literal match only: {e}"
                        );
                        None
                    }
                };
                ExemptionRule {
                    raw: raw.clone(),
                    pattern,
                }
            })
            .collect();
        Self { rules }
    }

    /// First match wins: literal whole-image equality, then an unanchored
    /// regex search. Uncompilable entries only ever match literally.
    pub fn is_exempt(&self, image: &str) -> bool {
        self.rules.iter().any(|rule| {
            rule.raw == image
                || rule
                    .pattern
                    .as_ref()
                    .is_some_and(|re| re.is_match(image))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(entries: &[&str]) -> Exemptions {
        Exemptions::compile(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let ex = compile(&[]);
        assert!(!ex.is_exempt("lib/redis:6"));
    }

    #[test]
    fn test_literal_match() {
        let ex = compile(&["internal.example.com/tools/debug:v3"]);
        assert!(ex.is_exempt("internal.example.com/tools/debug:v3"));
        assert!(!ex.is_exempt("internal.example.com/tools/debug:v4"));
    }

    #[test]
    fn test_regex_match_is_unanchored() {
        let ex = compile(&[".*redis:.*"]);
        assert!(ex.is_exempt("lib/redis:6"));
        assert!(ex.is_exempt("docker.io/library/redis:7.2"));
        assert!(!ex.is_exempt("curlimages/curl:8.13.0"));
    }

    #[test]
    fn test_invalid_regex_is_skipped_silently() {
        let ex = compile(&["[unclosed", ".*redis:.*"]);
        // the broken entry still matches itself literally
        assert!(ex.is_exempt("[unclosed"));
        assert!(!ex.is_exempt("unclosed"));
        // and later rules still apply
        assert!(ex.is_exempt("lib/redis:6"));
    }

    #[test]
    fn test_first_match_wins_order_is_declaration_order() {
        let ex = compile(&["^quay\\.io/.*", ".*redis:.*"]);
        assert!(ex.is_exempt("quay.io/app/api:1"));
        assert!(ex.is_exempt("lib/redis:6"));
    }
}
