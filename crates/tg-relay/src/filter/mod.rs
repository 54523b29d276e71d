//! Text classifiers that decide what must not be relayed.
//!
//! Both classifiers are pure and infallible. They are driven by a
//! [`FilterRules`] table, see `default_rules.yml` for the builtin one.

mod rules;

use crate::prelude::*;
use lazy_regex::Regex;

pub(crate) use rules::{FilterRules, FilterRulesError};

#[derive(Debug)]
pub(crate) struct Filter {
    charity: Regex,
    ad_rules: Vec<AdRule>,

    /// Lowercased refusal sentences
    refusals: Vec<String>,
    sensitive: Vec<Regex>,
}

#[derive(Debug)]
struct AdRule {
    name: String,
    regex: Regex,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AdVerdict<'t> {
    Clean,

    /// Charity vocabulary overrides any ad rule
    Charity,

    Ad {
        rule: &'t str,
        fragment: &'t str,
    },
}

impl Filter {
    pub(crate) fn classify<'t>(&'t self, text: &'t str) -> AdVerdict<'t> {
        if self.charity.is_match(text) {
            return AdVerdict::Charity;
        }

        self.ad_rules
            .iter()
            .find_map(|rule| {
                let found = rule.regex.find(text)?;
                Some(AdVerdict::Ad {
                    rule: &rule.name,
                    fragment: found.as_str(),
                })
            })
            .unwrap_or(AdVerdict::Clean)
    }

    pub(crate) fn is_advertisement(&self, text: &str) -> bool {
        match self.classify(text) {
            AdVerdict::Clean => false,
            AdVerdict::Charity => {
                debug!("Text contains charity vocabulary, not treating it as an ad");
                false
            }
            AdVerdict::Ad { rule, fragment } => {
                info!(rule, fragment, "Text is classified as an advertisement");
                true
            }
        }
    }

    /// Recognizes refusal answers of the LLM and sensitive-topic artifacts.
    pub(crate) fn is_error_or_sensitive(&self, text: &str) -> bool {
        let normalized = text.trim().to_lowercase();

        if self
            .refusals
            .iter()
            .any(|refusal| normalized.contains(refusal.as_str()))
        {
            warn!("Text matches a known LLM refusal");
            return true;
        }

        if let Some(found) = self
            .sensitive
            .iter()
            .find_map(|pattern| pattern.find(&normalized))
        {
            warn!(fragment = found.as_str(), "Text contains a sensitive pattern");
            return true;
        }

        false
    }
}

#[cfg(test)]
pub(crate) fn test_filter() -> Filter {
    FilterRules::builtin().unwrap().compile().unwrap()
}
