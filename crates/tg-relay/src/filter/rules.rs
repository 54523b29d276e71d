use super::{AdRule, Filter};
use crate::prelude::*;
use crate::{err, err_ctx, Result};
use lazy_regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_RULES: &str = include_str!("default_rules.yml");

/// Raw filter table as it is written in YAML
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FilterRules {
    charity: Pattern,
    ad_rules: Vec<AdRuleDef>,
    refusals: Vec<String>,
    sensitive: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdRuleDef {
    name: String,
    pattern: Pattern,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Pattern {
    Single(String),
    AnyOf(Vec<String>),
}

impl Pattern {
    fn to_regex_source(&self) -> String {
        match self {
            Pattern::Single(pattern) => pattern.clone(),
            Pattern::AnyOf(alternatives) => alternatives
                .iter()
                .map(|alternative| format!("(?:{alternative})"))
                .collect::<Vec<_>>()
                .join("|"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum FilterRulesError {
    #[error("Failed to read filter rules from {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Filter rules at {path} are malformed")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Filter rule `{rule}` has an invalid regex pattern")]
    InvalidPattern {
        rule: String,
        source: lazy_regex::regex::Error,
    },

    #[error("Filter rules must contain at least one ad rule")]
    NoAdRules,
}

impl FilterRules {
    /// Parses the table that is shipped with the binary
    pub(crate) fn builtin() -> Result<Self> {
        Self::parse(DEFAULT_RULES, Path::new("<builtin>"))
    }

    pub(crate) async fn from_file(path: &Path) -> Result<Self> {
        let yaml = fs_err::tokio::read_to_string(path)
            .await
            .map_err(|source| {
                err!(FilterRulesError::Read {
                    path: path.to_owned(),
                    source,
                })
            })?;

        Self::parse(&yaml, path)
    }

    /// Loads the rules from the file if it's given, or falls back to the builtin table.
    pub(crate) async fn load(path: Option<&Path>) -> Result<Filter> {
        let rules = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading filter rules from file");
                Self::from_file(path).await?
            }
            None => Self::builtin()?,
        };
        rules.compile()
    }

    fn parse(yaml: &str, path: &Path) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(err_ctx!(FilterRulesError::Parse {
            path: path.to_owned()
        }))
    }

    pub(crate) fn compile(self) -> Result<Filter> {
        if self.ad_rules.is_empty() {
            return Err(err!(FilterRulesError::NoAdRules));
        }

        let charity = compile_regex("charity", &self.charity.to_regex_source())?;

        let ad_rules = self
            .ad_rules
            .into_iter()
            .map(|rule| {
                let regex = compile_regex(&rule.name, &rule.pattern.to_regex_source())?;
                Ok(AdRule {
                    name: rule.name,
                    regex,
                })
            })
            .collect::<Result<_>>()?;

        let sensitive = self
            .sensitive
            .iter()
            .map(|pattern| compile_regex("sensitive", pattern))
            .collect::<Result<_>>()?;

        let refusals = self
            .refusals
            .iter()
            .map(|refusal| refusal.trim().to_lowercase())
            .filter(|refusal| !refusal.is_empty())
            .collect();

        Ok(Filter {
            charity,
            ad_rules,
            refusals,
            sensitive,
        })
    }
}

fn compile_regex(rule: &str, pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(err_ctx!(FilterRulesError::InvalidPattern {
            rule: rule.to_owned()
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use assert_matches::assert_matches;

    #[test]
    fn builtin_rules_compile() {
        let filter = FilterRules::builtin().unwrap().compile().unwrap();
        let names: Vec<_> = filter.ad_rules.iter().map(|rule| rule.name.as_str()).collect();
        assert_eq!(
            names,
            ["link", "promo", "mention", "leading_hashtag", "call_to_action"]
        );
    }

    #[test]
    fn custom_rules_replace_builtin_ones() {
        let yaml = r#"
charity: сбор
ad_rules:
  - name: shop
    pattern: [магазин, 'купи(те)?']
refusals: ["Не могу ответить"]
sensitive: []
"#;
        let filter = FilterRules::parse(yaml, Path::new("test.yml"))
            .unwrap()
            .compile()
            .unwrap();

        assert!(filter.is_advertisement("Новый МАГАЗИН открыт"));
        assert!(filter.is_advertisement("купите слона"));
        assert!(!filter.is_advertisement("https://example.com"));
        assert!(!filter.is_advertisement("сбор в магазине"));
        assert!(filter.is_error_or_sensitive("не могу ответить на это"));
    }

    #[test]
    fn invalid_regex_is_reported_with_rule_name() {
        let yaml = r#"
charity: сбор
ad_rules:
  - name: broken
    pattern: '(unclosed'
refusals: []
sensitive: []
"#;
        let err = FilterRules::parse(yaml, Path::new("test.yml"))
            .unwrap()
            .compile()
            .unwrap_err();

        assert_matches!(
            err.kind(),
            ErrorKind::Filter {
                source: FilterRulesError::InvalidPattern { rule, .. }
            } if rule == "broken"
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = "charity: x\nad_rules: []\nrefusals: []\nsensitive: []\nextra: 1\n";
        let err = FilterRules::parse(yaml, Path::new("test.yml")).unwrap_err();
        assert_matches!(
            err.kind(),
            ErrorKind::Filter {
                source: FilterRulesError::Parse { .. }
            }
        );
    }

    #[test]
    fn empty_ad_rules_are_rejected() {
        let yaml = "charity: x\nad_rules: []\nrefusals: []\nsensitive: []\n";
        let err = FilterRules::parse(yaml, Path::new("test.yml"))
            .unwrap()
            .compile()
            .unwrap_err();
        assert_matches!(
            err.kind(),
            ErrorKind::Filter {
                source: FilterRulesError::NoAdRules
            }
        );
    }

    #[test_log::test(tokio::test)]
    async fn missing_rules_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FilterRules::load(Some(&dir.path().join("nope.yml")))
            .await
            .unwrap_err();
        assert_matches!(
            err.kind(),
            ErrorKind::Filter {
                source: FilterRulesError::Read { .. }
            }
        );
    }
}
