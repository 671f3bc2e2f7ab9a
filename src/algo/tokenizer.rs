use once_cell::sync::Lazy;
use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

/// Split text into word tokens on whitespace and word boundaries.
///
/// Fields are normalised before they reach the tokenizer, so tokens come
/// back already lowercased and ASCII.
pub fn tokens(text: &str) -> Vec<String> {
    text.unicode_words().map(str::to_string).collect()
}

/// Character n-grams of the text. Strings shorter than `n` produce none.
pub fn shingles(text: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < n {
        return Vec::new();
    }
    chars.windows(n).map(|w| w.iter().collect()).collect()
}

static INTEGERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));

/// All runs of decimal digits in the text, in order of appearance.
pub fn integers(text: &str) -> Vec<String> {
    INTEGERS
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}
