//! Streaming inference support
//!
//! Handles the fragment-by-fragment protocol between a runtime and its consumer:
//! the end-of-generation sentinel and stop-word withholding.

/// Fragment a runtime returns once generation has ended. Never forwarded to consumers.
pub const EOG_SENTINEL: &str = "[EOG]";

/// Strings that end generation once the output ends with them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopWords {
    words: Vec<String>,
}

impl StopWords {
    /// Builds a stop-word set, dropping empty strings and duplicates
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for word in words {
            let word = word.into();
            if !word.is_empty() && !out.contains(&word) {
                out.push(word);
            }
        }
        Self { words: out }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.words.iter().map(String::as_str)
    }

    /// All non-empty proper prefixes of every stop word
    fn proper_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = Vec::new();
        for word in &self.words {
            for (end, _) in word.char_indices().skip(1) {
                let prefix = &word[..end];
                if !prefixes.iter().any(|p| p == prefix) {
                    prefixes.push(prefix.to_string());
                }
            }
        }
        prefixes
    }
}

/// What the consumer should see after a fragment arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    /// Forward this text (all growth since the last forward)
    Forward(String),
    /// Nothing to forward yet; the output may be the start of a stop word
    Hold,
    /// A stop word completed. Forward the text before it (possibly empty) and end the stream.
    Stop(String),
}

/// Accumulates generated fragments and decides what may be shown.
///
/// Output that currently ends with a proper prefix of a stop word is withheld
/// until later fragments prove it is not a stop word.
#[derive(Debug, Clone)]
pub struct StopWordFilter {
    stop_words: StopWords,
    prefixes: Vec<String>,
    output: String,
    emitted: usize,
}

impl StopWordFilter {
    pub fn new(stop_words: StopWords) -> Self {
        let prefixes = stop_words.proper_prefixes();
        Self {
            stop_words,
            prefixes,
            output: String::new(),
            emitted: 0,
        }
    }

    pub fn push(&mut self, fragment: &str) -> Emission {
        self.output.push_str(fragment);

        let matched = self
            .stop_words
            .iter()
            .find(|word| self.output.ends_with(word))
            .map(str::len);
        if let Some(word_len) = matched {
            let cut = self.output.len() - word_len;
            self.output.truncate(cut);
            let safe = self.output.get(self.emitted..).unwrap_or_default().to_string();
            self.emitted = self.output.len();
            return Emission::Stop(safe);
        }

        if self.is_withholding() || self.emitted == self.output.len() {
            return Emission::Hold;
        }

        let growth = self.output[self.emitted..].to_string();
        self.emitted = self.output.len();
        Emission::Forward(growth)
    }

    /// True while the output ends with the beginning of a stop word
    pub fn is_withholding(&self) -> bool {
        self.prefixes.iter().any(|p| self.output.ends_with(p.as_str()))
    }

    /// Everything forwarded so far
    pub fn emitted(&self) -> &str {
        &self.output[..self.emitted]
    }

    /// Final consumer-visible text. A withheld tail is dropped.
    pub fn finish(self) -> String {
        let mut output = self.output;
        output.truncate(self.emitted);
        output
    }
}
