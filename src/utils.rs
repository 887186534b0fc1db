use std::ops::Range;

use lazy_static::lazy_static;
use regex::Regex;

pub type IntentName = String;
pub type SlotName = String;
pub type EntityName = String;
pub type ContextName = String;

lazy_static! {
    static ref CONSECUTIVE_SPACES: Regex = Regex::new(r"\s+").unwrap();
}

pub fn ranges_overlap(lhs: &Range<usize>, rhs: &Range<usize>) -> bool {
    lhs.start < rhs.end && rhs.start < lhs.end
}

/// Substring of `text` delimited by a range expressed in chars, not bytes
pub fn substring_with_char_range(text: &str, range: &Range<usize>) -> String {
    text.chars()
        .skip(range.start)
        .take(range.end.saturating_sub(range.start))
        .collect()
}

pub fn replace_consecutive_spaces(text: &str) -> String {
    CONSECUTIVE_SPACES.replace_all(text.trim(), " ").to_string()
}

pub fn mean<I: IntoIterator<Item = f32>>(values: I) -> f32 {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}
