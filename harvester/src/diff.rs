use serde::Serialize;
use std::fmt;

/// One changed attribute: its name and both values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Field-by-field comparison of an existing item with its incoming version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub subject: String,
    pub changes: Vec<FieldChange>,
}

impl Diff {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            changes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.field.as_str())
    }

    pub fn push(&mut self, field: impl Into<String>, old: Option<String>, new: Option<String>) {
        if old != new {
            self.changes.push(FieldChange {
                field: field.into(),
                old,
                new,
            });
        }
    }

    pub fn text(mut self, field: &str, old: Option<&str>, new: Option<&str>) -> Self {
        self.push(field, old.map(str::to_string), new.map(str::to_string));
        self
    }

    pub fn value<T: ToString + PartialEq>(mut self, field: &str, old: T, new: T) -> Self {
        if old != new {
            self.push(field, Some(old.to_string()), Some(new.to_string()));
        }
        self
    }

    /// Records a script change as short snippets starting at the first differing character.
    pub fn script(mut self, field: &str, old: &str, new: &str) -> Self {
        if let Some((old_snippet, new_snippet)) = snippet_at_difference(old, new, 20) {
            self.push(field, Some(old_snippet), Some(new_snippet));
        }
        self
    }
}

fn snippet_at_difference(old: &str, new: &str, width: usize) -> Option<(String, String)> {
    let mut old_chars = old.char_indices();
    let mut new_chars = new.char_indices();
    let (old_at, new_at) = loop {
        match (old_chars.next(), new_chars.next()) {
            (Some((_, a)), Some((_, b))) if a == b => continue,
            (Some((i, _)), Some((j, _))) => break (i, j),
            (Some((i, _)), None) => break (i, new.len()),
            (None, Some((j, _))) => break (old.len(), j),
            (None, None) => return None,
        }
    };
    let take = |s: &str| s.chars().take(width).collect::<String>();
    Some((take(&old[old_at..]), take(&new[new_at..])))
}

fn render_value(value: &Option<String>) -> String {
    match value {
        Some(v) => format!("'{v}'"),
        None => "<none>".to_string(),
    }
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {}",
            self.field,
            render_value(&self.old),
            render_value(&self.new)
        )
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.subject)?;
        if self.changes.is_empty() {
            return Ok(());
        }
        f.write_str(": ")?;
        for (i, change) in self.changes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{change}")?;
        }
        Ok(())
    }
}
