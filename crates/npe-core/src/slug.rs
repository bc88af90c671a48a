//! Title-to-slug normalization.
//!
//! The output alphabet is `[a-z0-9-]` and slugs are capped at [`SLUG_MAX_LEN`]
//! characters. Two notes on the edge behavior:
//!
//! - Truncation happens after separators are inserted, so a slug cut exactly at
//!   a separator keeps its trailing `-`.
//! - No uniqueness check is made. Distinct titles may share a slug.

use thiserror::Error;

pub const SLUG_MAX_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlugError {
    #[error("no text to derive a slug from")]
    EmptyInput,
}

/// Normalize human-entered text into a slug.
///
/// Lower-cases, trims, drops every character outside `a-z`, `0-9`, whitespace
/// and `-`, turns each whitespace run into a single `-`, then keeps the first
/// [`SLUG_MAX_LEN`] characters.
///
/// Text made only of dropped characters yields `Ok("")`; callers that persist
/// slugs decide what to do with that.
pub fn normalize(text: &str) -> Result<String, SlugError> {
    let lowered = text.to_lowercase();
    let trimmed = lowered.trim();
    if trimmed.is_empty() {
        return Err(SlugError::EmptyInput);
    }

    let mut slug = String::with_capacity(trimmed.len().min(SLUG_MAX_LEN * 2));
    let mut pending_separator = false;
    for ch in trimmed.chars() {
        if ch.is_whitespace() {
            pending_separator = true;
            continue;
        }
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' {
            if pending_separator {
                slug.push('-');
                pending_separator = false;
            }
            slug.push(ch);
        }
    }
    // Whitespace left behind by a dropped trailing symbol ("park !") still
    // becomes a separator.
    if pending_separator {
        slug.push('-');
    }

    // Output is ASCII only, so byte truncation is char truncation.
    slug.truncate(SLUG_MAX_LEN);
    Ok(slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_slug_shaped(s: &str) -> bool {
        s.len() <= SLUG_MAX_LEN
            && s
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }

    #[test]
    fn punctuated_title_becomes_hyphenated_slug() {
        assert_eq!(
            normalize("Grand Canyon: Rim-to-Rim!").unwrap(),
            "grand-canyon-rim-to-rim"
        );
        assert_eq!(normalize("  Yellowstone   National Park ").unwrap(), "yellowstone-national-park");
        assert_eq!(normalize("Hawai'i Volcanoes").unwrap(), "hawaii-volcanoes");
        assert_eq!(normalize("Tabs\tand\nnewlines").unwrap(), "tabs-and-newlines");
    }

    #[test]
    fn empty_and_blank_text_is_rejected() {
        assert_eq!(normalize(""), Err(SlugError::EmptyInput));
        assert_eq!(normalize("   "), Err(SlugError::EmptyInput));
        assert_eq!(normalize("\t\n"), Err(SlugError::EmptyInput));
    }

    #[test]
    fn symbols_only_text_normalizes_to_empty() {
        assert_eq!(normalize("!!!").unwrap(), "");
        assert_eq!(normalize("¿¡").unwrap(), "");
    }

    #[test]
    fn dropped_characters_do_not_split_or_join_words() {
        assert_eq!(normalize("Rock & Roll").unwrap(), "rock-roll");
        assert_eq!(normalize("a - b").unwrap(), "a---b");
        assert_eq!(normalize("park !").unwrap(), "park-");
        assert_eq!(normalize("! park").unwrap(), "-park");
        assert_eq!(normalize("Café Olé").unwrap(), "caf-ol");
    }

    #[test]
    fn output_is_always_slug_shaped() {
        let samples = [
            "Grand Canyon: Rim-to-Rim!",
            "Death Valley — hottest place on Earth",
            "Ünïcödé ÄND 123",
            "%%% 2024 ### Guide ***",
            "ALL CAPS TITLE",
            "emoji 🏞️ park",
            &"long title ".repeat(30),
        ];
        for sample in samples {
            let slug = normalize(sample).unwrap();
            assert!(is_slug_shaped(&slug), "{sample:?} -> {slug:?}");
        }
    }

    #[test]
    fn normalization_is_deterministic_and_idempotent() {
        let samples = ["Grand Canyon: Rim-to-Rim!", "a - b", "Acadia", &"x y ".repeat(80)];
        for sample in samples {
            let once = normalize(sample).unwrap();
            assert_eq!(normalize(sample).unwrap(), once);
            if !once.is_empty() {
                assert_eq!(normalize(&once).unwrap(), once);
            }
        }
    }

    #[test]
    fn truncation_keeps_a_trailing_separator() {
        let title = format!("{} tail", "a".repeat(99));
        let slug = normalize(&title).unwrap();
        assert_eq!(slug.len(), SLUG_MAX_LEN);
        assert!(slug.ends_with('-'));

        let long = "b".repeat(250);
        assert_eq!(normalize(&long).unwrap().len(), SLUG_MAX_LEN);
    }

    #[test]
    fn distinct_titles_may_share_a_slug() {
        assert_eq!(normalize("Zion!").unwrap(), normalize("zion").unwrap());
    }
}
