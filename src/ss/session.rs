//! Write Sessions
//!
//! A write session belongs to one connection and edits exactly one
//! sentence of one file. It is created by `BEGIN_WRITE`, mutated by
//! `APPLY`, and destroyed by `END_WRITE` or connection teardown. The
//! single-writer guarantee is per `(file, sentence)`: concurrent writers
//! on different sentences interleave, and merge-on-commit keeps their
//! edits from clobbering each other.

use anyhow::Result;
use dashmap::DashSet;

use super::store::SsStore;
use super::tokenizer::Document;

/// Server-wide table of held sentence locks. At most one holder per
/// `(file, sentence_index)` pair.
#[derive(Debug, Default)]
pub struct SentenceLocks {
    held: DashSet<(String, usize)>,
}

impl SentenceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock. `false` means another session holds it.
    pub fn acquire(&self, file: &str, sentence_index: usize) -> bool {
        self.held.insert((file.to_string(), sentence_index))
    }

    pub fn release(&self, file: &str, sentence_index: usize) {
        self.held.remove(&(file.to_string(), sentence_index));
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

/// Connection-scoped editing state between `BEGIN_WRITE` and `END_WRITE`.
#[derive(Debug)]
pub struct WriteSession {
    pub file: String,
    pub sentence_index: usize,
    pub doc: Document,
    /// Byte-exact copy of the file as it was at `BEGIN_WRITE`; becomes
    /// the undo snapshot at commit.
    pub pre_image: Option<Vec<u8>>,
}

impl WriteSession {
    /// Load and tokenize the target file for editing.
    ///
    /// A missing file is created empty and edited as a one-empty-sentence
    /// document (only sentence 0 is addressable then). For an existing
    /// file, `sentence_index == num_sentences` appends a fresh empty
    /// sentence. An index beyond that aborts the session: `Ok(None)`,
    /// caller releases the lock, and no error frame is sent until the
    /// next `APPLY` finds no active session.
    pub async fn prepare(
        store: &SsStore,
        file: &str,
        sentence_index: usize,
    ) -> Result<Option<WriteSession>> {
        let content = store.read_file(file).await?;
        let (mut doc, pre_image) = match content {
            None => {
                store.create_file(file).await?;
                (Document::empty(), None)
            }
            Some(bytes) => {
                let doc = Document::tokenize(&String::from_utf8_lossy(&bytes));
                (doc, Some(bytes))
            }
        };

        if sentence_index > doc.num_sentences() {
            return Ok(None);
        }
        if sentence_index == doc.num_sentences() {
            if pre_image.is_none() {
                // Freshly-created empty document: only sentence 0 exists.
                return Ok(None);
            }
            doc.ensure_sentence(sentence_index);
        }

        Ok(Some(WriteSession {
            file: file.to_string(),
            sentence_index,
            doc,
            pre_image,
        }))
    }

    /// Merge-on-commit: re-read the file as it is *now*, splice only this
    /// session's sentence back in, write atomically, and store the
    /// captured pre-image as the file's single undo snapshot.
    pub async fn commit(&self, store: &SsStore) -> Result<()> {
        let new_text = match store.read_file(&self.file).await? {
            Some(bytes) => {
                let mut current = Document::tokenize(&String::from_utf8_lossy(&bytes));
                current.ensure_sentence(self.sentence_index);
                let tokens = self
                    .doc
                    .sentences
                    .get(self.sentence_index)
                    .cloned()
                    .unwrap_or_default();
                current.replace_sentence(self.sentence_index, tokens);
                current.compose()
            }
            // File vanished underneath us; fall back to the session's view.
            None => self.doc.compose(),
        };

        store
            .write_undo(&self.file, self.pre_image.as_deref().unwrap_or(&[]))
            .await?;
        store.put_file(&self.file, new_text.as_bytes()).await?;
        Ok(())
    }
}
