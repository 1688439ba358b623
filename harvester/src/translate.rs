use crate::errors::{Result, SyncError};
use crate::config::HarvesterConfig;

/// Renames incoming codes so several data sources can share one local catalog.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NameTranslator {
    #[default]
    Identity,
    Prefix(String),
}

impl NameTranslator {
    pub fn from_config(config: &HarvesterConfig) -> Self {
        match config.data_source_alias.as_deref().map(str::trim) {
            Some(alias) if !alias.is_empty() => NameTranslator::Prefix(alias.to_string()),
            _ => NameTranslator::Identity,
        }
    }

    pub fn translate(&self, name: &str) -> String {
        match self {
            NameTranslator::Identity => name.to_string(),
            NameTranslator::Prefix(prefix) => format!("{prefix}_{name}"),
        }
    }

    pub fn translate_back(&self, name: &str) -> String {
        match self {
            NameTranslator::Identity => name.to_string(),
            NameTranslator::Prefix(prefix) => name
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('_'))
                .unwrap_or(name)
                .to_string(),
        }
    }

    /// Translates the space segment of `/SPACE/...` identifiers. Other segments are kept.
    pub fn translate_identifier(&self, identifier: &str) -> Result<String> {
        let trimmed = identifier.trim();
        let rest = trimmed
            .strip_prefix('/')
            .ok_or_else(|| SyncError::Identifier(format!("'{identifier}' does not start with '/'")))?;
        let mut segments = rest.split('/');
        let space = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::Identifier(format!("'{identifier}' has no space code")))?;
        let mut translated = format!("/{}", self.translate(space));
        for segment in segments {
            if segment.is_empty() {
                return Err(SyncError::Identifier(format!(
                    "'{identifier}' contains an empty segment"
                )));
            }
            translated.push('/');
            translated.push_str(segment);
        }
        Ok(translated)
    }

    /// Translates both parts of a `CODE (TYPE)` material reference.
    pub fn translate_material(&self, reference: &str) -> Result<String> {
        let (code, type_code) = parse_material_reference(reference)?;
        Ok(material_perm_id(&self.translate(&code), &self.translate(&type_code)))
    }
}

pub fn material_perm_id(code: &str, type_code: &str) -> String {
    format!("{code} ({type_code})")
}

/// Splits `CODE (TYPE)` into its parts.
pub fn parse_material_reference(reference: &str) -> Result<(String, String)> {
    let malformed = || {
        SyncError::Identifier(format!(
            "material reference '{reference}' is not of the form 'CODE (TYPE)'"
        ))
    };
    let trimmed = reference.trim();
    let inner = trimmed.strip_suffix(')').ok_or_else(malformed)?;
    let (code, type_code) = inner.rsplit_once(" (").ok_or_else(malformed)?;
    let code = code.trim();
    let type_code = type_code.trim();
    if code.is_empty() || type_code.is_empty() || type_code.contains('(') {
        return Err(malformed());
    }
    Ok((code.to_string(), type_code.to_string()))
}
