use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::types::NotificationUnit;

/// Ordered buffer of units waiting for a combined delivery.
///
/// Insertion order is delivery order. The first unit's timestamp is the age
/// of the whole batch.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    units: Vec<NotificationUnit>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, unit: NotificationUnit) {
        self.units.push(unit);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Timestamp of the oldest unit, `None` for an empty batch or a first
    /// unit that was never stamped.
    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.units.first().and_then(|unit| unit.timestamp)
    }

    /// Size estimate that decides flush-on-size.
    pub fn rendered_size(&self) -> usize {
        rendered_size(&self.units)
    }

    pub fn render(&self) -> String {
        render_units(&self.units)
    }

    pub fn clear(&mut self) {
        self.units.clear();
    }
}

/// Character count of `**{title}**\n{name}: {value}\n\n` summed over every
/// field of every unit. Units without fields count for nothing.
pub fn rendered_size(units: &[NotificationUnit]) -> usize {
    units
        .iter()
        .flat_map(|unit| {
            let title = unit.title.chars().count();
            unit.fields.iter().map(move |field| {
                title + field.name.chars().count() + field.value.chars().count() + 9
            })
        })
        .sum()
}

/// Render units as one markdown-ish text block.
pub fn render_units(units: &[NotificationUnit]) -> String {
    let mut out = String::new();
    for unit in units {
        let _ = writeln!(out, "**{}**", unit.title);
        for field in &unit.fields {
            let _ = writeln!(out, "{}: {}", field.name, field.value);
        }
        out.push('\n');
    }
    out
}

/// Split `text` into consecutive pieces of at most `max_chars` characters.
///
/// Pieces may cut through a rendered unit; concatenating them gives back
/// `text` exactly.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;

    for ch in text.chars() {
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Color;

    fn unit(title: &str, fields: &[(&str, &str)]) -> NotificationUnit {
        fields
            .iter()
            .fold(NotificationUnit::new(title, Color::Blue), |u, (n, v)| u.with_field(*n, *v))
    }

    #[test]
    fn renders_units_in_order() {
        let units = vec![
            unit("Member joined", &[("User", "ana"), ("ID", "1")]),
            unit("Member left", &[("User", "bo")]),
        ];
        assert_eq!(
            render_units(&units),
            "**Member joined**\nUser: ana\nID: 1\n\n**Member left**\nUser: bo\n\n"
        );
    }

    #[test]
    fn rendered_size_counts_title_per_field() {
        let u = unit("T", &[("a", "1"), ("bb", "22")]);
        let expected = "**T**\na: 1\n\n".chars().count() + "**T**\nbb: 22\n\n".chars().count();
        assert_eq!(rendered_size(&[u]), expected);
        assert_eq!(rendered_size(&[NotificationUnit::new("no fields", Color::Red)]), 0);
    }

    #[test]
    fn rendered_size_counts_characters_not_bytes() {
        let u = unit("é", &[("ü", "ß")]);
        assert_eq!(rendered_size(&[u]), "**é**\nü: ß\n\n".chars().count());
    }

    #[test]
    fn chunks_reassemble_exactly() {
        let units: Vec<_> = (0..120)
            .map(|i| {
                unit(
                    &format!("Message deleted #{i}"),
                    &[("Author", "someone"), ("Content", "ünïcödé text")],
                )
            })
            .collect();
        let text = render_units(&units);
        let chunks = chunk_text(&text, 2000);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 2000));
        assert!(chunks[..chunks.len() - 1].iter().all(|c| c.chars().count() == 2000));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunking_edges() {
        assert!(chunk_text("", 2000).is_empty());
        assert_eq!(chunk_text("abcd", 2), vec!["ab", "cd"]);
        assert_eq!(chunk_text("abcde", 2), vec!["ab", "cd", "e"]);
    }

    #[test]
    fn first_timestamp_tracks_oldest_unit() {
        let mut batch = Batch::new();
        assert_eq!(batch.first_timestamp(), None);
        batch.push(unit("unstamped", &[]));
        assert_eq!(batch.first_timestamp(), None);
        batch.clear();
        assert!(batch.is_empty());
    }
}
