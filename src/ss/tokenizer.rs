//! Sentence Tokenizer
//!
//! Documents are edited sentence-by-sentence, so the storage server keeps
//! an in-memory model of a file as an ordered sequence of sentences, each
//! an ordered sequence of tokens.
//!
//! Splitting rules:
//! - Whitespace separates tokens and is never kept.
//! - Any of `. ! ?` terminates the current sentence. The delimiter is
//!   appended to the preceding token (or becomes a single-char token if
//!   the sentence has none), and a new, possibly empty, sentence opens
//!   for whatever follows. A trailing delimiter therefore leaves an empty
//!   trailing sentence.
//!
//! `compose` reverses the split: tokens joined by single spaces, sentences
//! joined by single spaces. Delimiters travel inside their token, so
//! sentence structure survives the round trip. Sentences that render empty
//! are skipped so no stray separators appear in the output.

fn is_sentence_end(c: char) -> bool {
    c == '.' || c == '!' || c == '?'
}

/// Why an insert was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    SentenceOutOfRange,
    WordIndexOutOfRange,
    EmptyContent,
}

/// A tokenized document: sentences of tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub sentences: Vec<Vec<String>>,
}

impl Document {
    /// An empty document still has one (empty) sentence so that sentence
    /// index 0 is always addressable.
    pub fn empty() -> Self {
        Self {
            sentences: vec![Vec::new()],
        }
    }

    pub fn tokenize(text: &str) -> Self {
        let mut sentences: Vec<Vec<String>> = vec![Vec::new()];
        let mut current = String::new();

        for c in text.chars() {
            if c.is_whitespace() {
                if !current.is_empty() {
                    sentences.last_mut().unwrap().push(std::mem::take(&mut current));
                }
                continue;
            }
            if is_sentence_end(c) {
                let sentence = sentences.last_mut().unwrap();
                if !current.is_empty() {
                    current.push(c);
                    sentence.push(std::mem::take(&mut current));
                } else if let Some(last) = sentence.last_mut() {
                    last.push(c);
                } else {
                    sentence.push(c.to_string());
                }
                sentences.push(Vec::new());
                continue;
            }
            current.push(c);
        }
        if !current.is_empty() {
            sentences.last_mut().unwrap().push(current);
        }

        Self { sentences }
    }

    /// Join tokens with single spaces and sentences with single spaces.
    /// Sentences without any rendered content are skipped, which collapses
    /// the empty trailing sentence a terminal delimiter leaves behind.
    pub fn compose(&self) -> String {
        let mut out = String::new();
        for sentence in &self.sentences {
            if sentence.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&sentence.join(" "));
        }
        out
    }

    pub fn num_sentences(&self) -> usize {
        self.sentences.len()
    }

    pub fn word_count(&self, sentence_index: usize) -> usize {
        self.sentences
            .get(sentence_index)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Grow the sentence list with empty sentences until `index` is
    /// addressable.
    pub fn ensure_sentence(&mut self, index: usize) {
        while self.sentences.len() <= index {
            self.sentences.push(Vec::new());
        }
    }

    pub fn replace_sentence(&mut self, index: usize, tokens: Vec<String>) {
        self.ensure_sentence(index);
        self.sentences[index] = tokens;
    }

    /// Insert-before: split `content` on whitespace and splice the tokens
    /// into sentence `sentence_index` ahead of `word_index`.
    ///
    /// Append special cases (`word_index == word count`):
    /// - a single lone delimiter token glues onto the last existing token
    ///   without growing the sentence;
    /// - if the last existing token carries a trailing sentence delimiter,
    ///   the delimiter migrates to the last inserted token so the sentence
    ///   terminator stays at the true end.
    pub fn insert_words(
        &mut self,
        sentence_index: usize,
        word_index: usize,
        content: &str,
    ) -> Result<(), InsertError> {
        let Some(sentence) = self.sentences.get_mut(sentence_index) else {
            return Err(InsertError::SentenceOutOfRange);
        };
        let word_count = sentence.len();

        let mut tokens: Vec<String> = content.split_whitespace().map(String::from).collect();
        if tokens.is_empty() {
            return Err(InsertError::EmptyContent);
        }

        // Lone delimiter appended to a non-empty sentence: attach, done.
        if word_index >= word_count && word_count > 0 && content.len() == 1 {
            let c = content.chars().next().unwrap();
            if is_sentence_end(c) {
                sentence.last_mut().unwrap().push(c);
                return Ok(());
            }
        }

        if word_index > word_count {
            return Err(InsertError::WordIndexOutOfRange);
        }

        // Appending past a terminated sentence: move the delimiter from the
        // old last token to the new last token.
        if word_index == word_count && word_count > 0 {
            let last = sentence.last_mut().unwrap();
            if last.chars().last().map(is_sentence_end).unwrap_or(false) {
                let delim = last.pop().unwrap();
                tokens.last_mut().unwrap().push(delim);
            }
        }

        sentence.splice(word_index..word_index, tokens);
        Ok(())
    }
}
