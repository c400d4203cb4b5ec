//! Text tokenizers for the full-text index.

use indexmap::IndexSet;
use std::collections::HashSet;
use std::fmt;

/// Splits text into index tokens.
pub trait Tokenizer: Send + Sync {
    /// Distinct tokens of `text`, in first-seen order.
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Languages with built-in stop word lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    English,
    French,
    German,
    Spanish,
}

impl Language {
    pub fn stop_words(&self) -> &'static [&'static str] {
        match self {
            Language::English => ENGLISH,
            Language::French => FRENCH,
            Language::German => GERMAN,
            Language::Spanish => SPANISH,
        }
    }
}

/// Word-boundary tokenizer that lower-cases and drops stop words.
///
/// Words are runs of alphanumeric characters; an apostrophe between two
/// letters stays inside the word (`don't`).
#[derive(Clone)]
pub struct StopWordTokenizer {
    stop_words: HashSet<String>,
}

impl fmt::Debug for StopWordTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopWordTokenizer")
            .field("stop_words", &self.stop_words.len())
            .finish()
    }
}

impl StopWordTokenizer {
    pub fn new(languages: &[Language]) -> Self {
        Self::with_stop_words(languages.iter().flat_map(|l| l.stop_words().iter().copied()))
    }

    pub fn english() -> Self {
        Self::new(&[Language::English])
    }

    pub fn with_stop_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            stop_words: words.into_iter().map(|w| w.as_ref().to_lowercase()).collect(),
        }
    }

    pub fn is_stop_word(&self, word: &str) -> bool {
        self.stop_words.contains(word)
    }
}

impl Default for StopWordTokenizer {
    fn default() -> Self {
        Self::english()
    }
}

impl Tokenizer for StopWordTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = IndexSet::new();
        for word in split_words(text) {
            let word = word.to_lowercase();
            if !self.is_stop_word(&word) {
                tokens.insert(word);
            }
        }
        tokens.into_iter().collect()
    }
}

fn split_words(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut words = Vec::new();
    let mut start: Option<usize> = None;

    for (i, &(pos, c)) in chars.iter().enumerate() {
        let inner_apostrophe = (c == '\'' || c == '\u{2019}')
            && start.is_some()
            && chars.get(i + 1).is_some_and(|(_, n)| n.is_alphanumeric());
        if c.is_alphanumeric() || inner_apostrophe {
            start.get_or_insert(pos);
        } else if let Some(s) = start.take() {
            words.push(&text[s..pos]);
        }
    }
    if let Some(s) = start {
        words.push(&text[s..]);
    }
    words
}

const ENGLISH: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself",
    "him", "himself", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just",
    "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on", "once",
    "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours", "yourself",
    "yourselves",
];

const FRENCH: &[&str] = &[
    "au", "aux", "avec", "ce", "ces", "dans", "de", "des", "du", "elle", "en", "et", "eux", "il",
    "je", "la", "le", "les", "leur", "lui", "ma", "mais", "me", "mes", "moi", "mon", "ne", "nos",
    "notre", "nous", "on", "ou", "par", "pas", "pour", "qu", "que", "qui", "sa", "se", "ses",
    "son", "sur", "ta", "te", "tes", "toi", "ton", "tu", "un", "une", "vos", "votre", "vous",
];

const GERMAN: &[&str] = &[
    "aber", "als", "am", "an", "auch", "auf", "aus", "bei", "bin", "bis", "das", "dass", "dem",
    "den", "der", "des", "die", "du", "ein", "eine", "einem", "einen", "einer", "er", "es",
    "für", "hat", "ich", "ihr", "im", "in", "ist", "mit", "nach", "nicht", "noch", "oder",
    "sich", "sie", "sind", "so", "und", "uns", "von", "vor", "war", "was", "wie", "wir", "zu",
    "zum", "zur",
];

const SPANISH: &[&str] = &[
    "al", "como", "con", "de", "del", "el", "en", "es", "esta", "este", "ha", "la", "las", "le",
    "lo", "los", "más", "me", "mi", "no", "nos", "o", "para", "pero", "por", "que", "se", "si",
    "sin", "su", "sus", "te", "tu", "un", "una", "uno", "y", "ya", "yo",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_english_drops_stop_words_and_lowercases() {
        let t = StopWordTokenizer::english();
        assert_eq!(
            t.tokenize("The Quick brown fox, and THE lazy dog!"),
            vec!["quick", "brown", "fox", "lazy", "dog"]
        );
    }

    #[test]
    fn test_tokens_are_distinct() {
        let t = StopWordTokenizer::english();
        assert_eq!(t.tokenize("echo Echo ECHO"), vec!["echo"]);
    }

    #[test]
    fn test_apostrophes_and_unicode() {
        let t = StopWordTokenizer::with_stop_words(Vec::<String>::new());
        assert_eq!(t.tokenize("don't 'quoted' Ærø-island"), vec!["don't", "quoted", "ærø", "island"]);
    }

    #[test]
    fn test_multiple_languages() {
        let t = StopWordTokenizer::new(&[Language::English, Language::German]);
        assert_eq!(t.tokenize("the Hund und die Katze"), vec!["hund", "katze"]);
    }
}
