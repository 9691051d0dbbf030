//! Attribute validation for terms and vocabularies.
//!
//! Validation rules are pluggable through [`TermValidator`]; the stores only
//! enforce uniqueness, which needs storage to decide.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{FieldErrors, Result, INVALID_FORMAT, REQUIRED, TOO_LONG};
use crate::models::{CreateVocabularyRequest, TermAttributes, ValidTerm};

/// Maximum length of names, titles and slugs (characters).
pub const MAX_NAME_LEN: usize = 255;

/// Lower-case ASCII words joined by single hyphens.
static SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid slug regex"));

/// Domain rules applied to term attributes before anything is stored.
pub trait TermValidator: Send + Sync {
    /// Validate and normalize. Failures carry one entry per offending field.
    fn validate(&self, attrs: &TermAttributes) -> Result<ValidTerm>;
}

/// Default rules: name required, slug derived from the name when absent,
/// slug format enforced, lengths capped at [`MAX_NAME_LEN`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTermValidator;

impl TermValidator for DefaultTermValidator {
    fn validate(&self, attrs: &TermAttributes) -> Result<ValidTerm> {
        let mut errors = FieldErrors::new();

        let name = attrs.name.trim().to_string();
        if name.is_empty() {
            errors.add("name", REQUIRED);
        } else if name.chars().count() > MAX_NAME_LEN {
            errors.add("name", TOO_LONG);
        }

        let slug = match attrs.slug.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => slugify(&name),
        };
        if slug.is_empty() {
            // Either no name at all, or a name without a single ASCII alphanumeric.
            if !name.is_empty() {
                errors.add("slug", REQUIRED);
            }
        } else if slug.len() > MAX_NAME_LEN {
            errors.add("slug", TOO_LONG);
        } else if !is_slug(&slug) {
            errors.add("slug", INVALID_FORMAT);
        }

        errors.into_result()?;
        Ok(ValidTerm {
            name,
            slug,
            description: attrs
                .description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
        })
    }
}

/// Whether `s` is a well-formed slug.
pub fn is_slug(s: &str) -> bool {
    SLUG_RE.is_match(s)
}

/// Derive a slug: lower-case ASCII alphanumerics, every other run of
/// characters collapsed into one hyphen, no leading or trailing hyphen.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_hyphen = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Check a vocabulary creation request.
pub fn validate_vocabulary(req: &CreateVocabularyRequest) -> Result<()> {
    let mut errors = FieldErrors::new();

    if req.alias.is_empty() {
        errors.add("alias", REQUIRED);
    } else if req.alias.len() > MAX_NAME_LEN {
        errors.add("alias", TOO_LONG);
    } else if !is_slug(&req.alias) {
        errors.add("alias", INVALID_FORMAT);
    }

    if req.title.trim().is_empty() {
        errors.add("title", REQUIRED);
    } else if req.title.chars().count() > MAX_NAME_LEN {
        errors.add("title", TOO_LONG);
    }

    if req.types.iter().any(|t| !is_slug(t)) {
        errors.add("types", INVALID_FORMAT);
    }

    errors.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn field_codes(err: Error, field: &str) -> Vec<String> {
        match err {
            Error::Validation(fields) => fields.get(field).map(<[String]>::to_vec).unwrap_or_default(),
            other => panic!("Expected Validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Sports"), "sports");
        assert_eq!(slugify("  Rust & Go -- Systems  "), "rust-go-systems");
        assert_eq!(slugify("Año 2024"), "a-o-2024");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_is_slug() {
        assert!(is_slug("sports"));
        assert!(is_slug("web-dev-2"));
        assert!(!is_slug("Sports"));
        assert!(!is_slug("-leading"));
        assert!(!is_slug("double--hyphen"));
        assert!(!is_slug(""));
    }

    #[test]
    fn test_validate_derives_slug_and_trims() {
        let valid = DefaultTermValidator
            .validate(&TermAttributes::named("  Web Development ").with_description("  "))
            .unwrap();
        assert_eq!(valid.name, "Web Development");
        assert_eq!(valid.slug, "web-development");
        assert_eq!(valid.description, None);
    }

    #[test]
    fn test_validate_keeps_explicit_slug() {
        let valid = DefaultTermValidator
            .validate(&TermAttributes::named("Sports").with_slug("sport"))
            .unwrap();
        assert_eq!(valid.slug, "sport");
    }

    #[test]
    fn test_validate_requires_name() {
        let err = DefaultTermValidator
            .validate(&TermAttributes::default())
            .unwrap_err();
        assert_eq!(field_codes(err, "name"), vec![REQUIRED]);
    }

    #[test]
    fn test_validate_rejects_bad_slug() {
        let err = DefaultTermValidator
            .validate(&TermAttributes::named("Sports").with_slug("Not A Slug"))
            .unwrap_err();
        assert_eq!(field_codes(err, "slug"), vec![INVALID_FORMAT]);
    }

    #[test]
    fn test_validate_name_without_ascii_needs_slug() {
        let err = DefaultTermValidator
            .validate(&TermAttributes::named("日本"))
            .unwrap_err();
        assert_eq!(field_codes(err, "slug"), vec![REQUIRED]);

        let valid = DefaultTermValidator
            .validate(&TermAttributes::named("日本").with_slug("japan"))
            .unwrap();
        assert_eq!(valid.slug, "japan");
    }

    #[test]
    fn test_validate_too_long() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        let err = DefaultTermValidator
            .validate(&TermAttributes::named(long))
            .unwrap_err();
        match err {
            Error::Validation(fields) => {
                assert_eq!(fields.get("name"), Some(&[TOO_LONG.to_string()][..]));
                assert_eq!(fields.get("slug"), Some(&[TOO_LONG.to_string()][..]));
            }
            other => panic!("Expected Validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_vocabulary() {
        let ok = CreateVocabularyRequest {
            alias: "categories".into(),
            title: "Categories".into(),
            types: vec!["blog".into(), "page".into()],
            ..Default::default()
        };
        assert!(validate_vocabulary(&ok).is_ok());

        let bad = CreateVocabularyRequest {
            alias: "Bad Alias".into(),
            title: " ".into(),
            types: vec!["Blog Post".into()],
            ..Default::default()
        };
        match validate_vocabulary(&bad).unwrap_err() {
            Error::Validation(fields) => {
                assert_eq!(
                    fields.fields().collect::<Vec<_>>(),
                    vec!["alias", "title", "types"]
                );
            }
            other => panic!("Expected Validation error, got {:?}", other),
        }
    }
}
