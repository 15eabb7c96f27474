//! SentencePiece-style unigram tokenizer
//!
//! Viterbi segmentation over a scored vocabulary with a byte-level trie,
//! UTF-8 pretokenization, a thread-safe piece cache, and character-level
//! fallback for out-of-vocabulary input.
//!
//! The vocabulary file is UTF-8 text, one `<piece><whitespace><score>` row
//! per line. The final whitespace-delimited field is the score (log
//! probability); everything before it is the piece. Rows that do not parse
//! are skipped.
//!
//! ## Example
//!
//! ```rust,ignore
//! let tokenizer = UnigramTokenizer::from_file("unigram.txt", &SpecialTokens::default(), true, true, -10.0)?;
//! let ids = tokenizer.encode("Hello world", true, false, false, false);
//! let text = tokenizer.decode(&ids, true);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use tracing::debug;

use crate::error::{Result, ServirError};
use crate::trie::ByteTrie;
use crate::utf8::{codepoint_len_lossy, is_unicode_space, next_codepoint};

/// The SentencePiece whitespace sentinel (`U+2581`, lower one-eighth block).
pub const WS_SENTINEL: char = '\u{2581}';

/// Log probability assigned to appended special tokens so they never win
/// segmentation against real pieces.
const SPECIAL_LOGPROB: f64 = -1e9;

/// Special token names requested at load time.
#[derive(Debug, Clone, Default)]
pub struct SpecialTokens {
    /// Beginning-of-sequence token
    pub bos: Option<String>,
    /// End-of-sequence token
    pub eos: Option<String>,
    /// Unknown token
    pub unk: Option<String>,
    /// Separator token
    pub sep: Option<String>,
    /// Padding token
    pub pad: Option<String>,
    /// Classification token
    pub cls: Option<String>,
    /// Mask token
    pub mask: Option<String>,
}

/// Resolved ids for the special tokens; `None` when not configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecialTokenIds {
    /// Beginning-of-sequence id
    pub bos_id: Option<u32>,
    /// End-of-sequence id
    pub eos_id: Option<u32>,
    /// Unknown-token id
    pub unk_id: Option<u32>,
    /// Separator id
    pub sep_id: Option<u32>,
    /// Padding id
    pub pad_id: Option<u32>,
    /// Classification id
    pub cls_id: Option<u32>,
    /// Mask id
    pub mask_id: Option<u32>,
}

impl SpecialTokenIds {
    fn contains(&self, id: u32) -> bool {
        [
            self.bos_id,
            self.eos_id,
            self.unk_id,
            self.sep_id,
            self.pad_id,
            self.cls_id,
            self.mask_id,
        ]
        .iter()
        .any(|slot| *slot == Some(id))
    }
}

/// Unigram tokenizer built once per model directory and shared read-only.
///
/// All fields are immutable after construction except the piece cache,
/// which is synchronized internally.
pub struct UnigramTokenizer {
    id_to_token: Vec<String>,
    token_to_id: HashMap<String, u32>,
    token_logprob: Vec<f64>,
    trie: ByteTrie,
    special_ids: SpecialTokenIds,
    fallback_to_chars: bool,
    unk_penalty: f64,
    piece_cache: RwLock<HashMap<String, Vec<String>>>,
}

impl std::fmt::Debug for UnigramTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnigramTokenizer")
            .field("vocab_size", &self.id_to_token.len())
            .field("special_ids", &self.special_ids)
            .field("fallback_to_chars", &self.fallback_to_chars)
            .field("unk_penalty", &self.unk_penalty)
            .finish_non_exhaustive()
    }
}

/// Parse one vocabulary row into `(piece, score)`.
///
/// The score is everything after the last space or tab; both halves are
/// trimmed. Returns `None` for rows that do not fit the shape.
fn parse_vocab_line(line: &str) -> Option<(String, f64)> {
    let s = line.trim();
    if s.is_empty() {
        return None;
    }
    let pos = s.rfind([' ', '\t'])?;
    let piece = s[..pos].trim();
    let num = s[pos + 1..].trim();
    if piece.is_empty() || num.is_empty() {
        return None;
    }
    let score: f64 = num.parse().ok()?;
    Some((piece.to_string(), score))
}

impl UnigramTokenizer {
    /// Load a unigram vocabulary from a text file.
    ///
    /// Invalid rows are skipped; a file yielding zero valid rows is an
    /// error. When `add_special_if_missing` is set, requested special
    /// tokens absent from the vocabulary are appended with a large negative
    /// score.
    ///
    /// # Errors
    ///
    /// Returns [`ServirError::ModelFile`] when the file cannot be read or
    /// contains no valid rows.
    pub fn from_file(
        path: impl AsRef<Path>,
        special: &SpecialTokens,
        add_special_if_missing: bool,
        fallback_to_chars: bool,
        unk_penalty: f64,
    ) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ServirError::ModelFile {
            path: path.display().to_string(),
            reason: format!("failed to open: {e}"),
        })?;

        let mut vocab = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            match parse_vocab_line(line) {
                Some(entry) => vocab.push(entry),
                None => {
                    if !line.trim().is_empty() {
                        debug!(line = lineno + 1, "skipping invalid vocabulary row");
                    }
                }
            }
        }

        if vocab.is_empty() {
            return Err(ServirError::ModelFile {
                path: path.display().to_string(),
                reason: "no valid vocabulary rows".to_string(),
            });
        }

        Self::from_vocab(
            vocab,
            special,
            add_special_if_missing,
            fallback_to_chars,
            unk_penalty,
        )
    }

    /// Build a tokenizer from `(piece, score)` pairs.
    ///
    /// Duplicate pieces overwrite: the later id wins both the lookup table
    /// and the trie terminal.
    ///
    /// # Errors
    ///
    /// Returns [`ServirError::ModelFile`] when `vocab` is empty.
    pub fn from_vocab(
        vocab: Vec<(String, f64)>,
        special: &SpecialTokens,
        add_special_if_missing: bool,
        fallback_to_chars: bool,
        unk_penalty: f64,
    ) -> Result<Self> {
        if vocab.is_empty() {
            return Err(ServirError::ModelFile {
                path: "<memory>".to_string(),
                reason: "vocabulary cannot be empty".to_string(),
            });
        }

        let mut id_to_token = Vec::with_capacity(vocab.len());
        let mut token_logprob = Vec::with_capacity(vocab.len());
        for (piece, score) in vocab {
            id_to_token.push(piece);
            token_logprob.push(score);
        }

        let mut token_to_id = HashMap::with_capacity(id_to_token.len() * 2);
        let mut trie = ByteTrie::new();
        for (id, token) in id_to_token.iter().enumerate() {
            let id = id as u32;
            token_to_id.insert(token.clone(), id);
            trie.insert(token.as_bytes(), id);
        }

        let mut tok = Self {
            id_to_token,
            token_to_id,
            token_logprob,
            trie,
            special_ids: SpecialTokenIds::default(),
            fallback_to_chars,
            unk_penalty,
            piece_cache: RwLock::new(HashMap::new()),
        };
        tok.ensure_special_tokens(special, add_special_if_missing);
        Ok(tok)
    }

    /// Resolve one special token, appending it when missing and asked to.
    fn ensure_special(&mut self, name: Option<&str>, add_if_missing: bool) -> Option<u32> {
        let name = name?;
        if let Some(&id) = self.token_to_id.get(name) {
            return Some(id);
        }
        if !add_if_missing {
            return None;
        }
        let id = self.id_to_token.len() as u32;
        self.id_to_token.push(name.to_string());
        self.token_to_id.insert(name.to_string(), id);
        self.token_logprob.push(SPECIAL_LOGPROB);
        self.trie.insert(name.as_bytes(), id);
        Some(id)
    }

    /// Resolve requested special tokens, appending missing ones when asked.
    fn ensure_special_tokens(&mut self, special: &SpecialTokens, add_if_missing: bool) {
        let ids = SpecialTokenIds {
            bos_id: self.ensure_special(special.bos.as_deref(), add_if_missing),
            eos_id: self.ensure_special(special.eos.as_deref(), add_if_missing),
            unk_id: self.ensure_special(special.unk.as_deref(), add_if_missing),
            sep_id: self.ensure_special(special.sep.as_deref(), add_if_missing),
            pad_id: self.ensure_special(special.pad.as_deref(), add_if_missing),
            cls_id: self.ensure_special(special.cls.as_deref(), add_if_missing),
            mask_id: self.ensure_special(special.mask.as_deref(), add_if_missing),
        };
        self.special_ids = ids;
    }

    /// Split input on Unicode whitespace and rejoin each non-empty run with
    /// a leading `U+2581` sentinel. Empty input produces no pieces.
    #[must_use]
    pub fn pretokenize(text: &str) -> Vec<String> {
        let bytes = text.as_bytes();
        let mut out = Vec::new();
        let mut curr = String::new();

        let mut i = 0;
        while i < bytes.len() {
            let Some((cp, len)) = next_codepoint(bytes, i) else {
                break;
            };
            if is_unicode_space(cp) {
                if !curr.is_empty() {
                    out.push(format!("{WS_SENTINEL}{curr}"));
                    curr.clear();
                }
            } else {
                curr.push_str(&text[i..i + len]);
            }
            i += len;
        }
        if !curr.is_empty() {
            out.push(format!("{WS_SENTINEL}{curr}"));
        }
        out
    }

    /// Viterbi-segment one pretokenized piece into vocabulary tokens.
    ///
    /// `dp[i]` is the best log probability of segmenting `piece[i..]`. When
    /// no vocabulary piece matches at a position, the segmenter falls back
    /// to one UTF-8 codepoint: a direct vocabulary hit if the codepoint is
    /// a piece, otherwise the unknown penalty with the raw substring kept
    /// in the output. Ties keep the earlier-considered transition, so
    /// results are deterministic given the trie's length-ordered matches.
    #[must_use]
    pub fn segment_piece(&self, piece: &str) -> Vec<String> {
        let bytes = piece.as_bytes();
        let n = bytes.len();
        if n == 0 {
            return Vec::new();
        }

        let mut dp = vec![f64::NEG_INFINITY; n + 1];
        let mut back_len = vec![0usize; n + 1];
        let mut back_tid: Vec<Option<u32>> = vec![None; n + 1];
        dp[n] = 0.0;

        let mut matches: Vec<(u32, usize)> = Vec::new();

        for i in (0..n).rev() {
            self.trie.matches_at(bytes, i, &mut matches);

            if matches.is_empty() {
                let cplen = codepoint_len_lossy(bytes, i);
                let ch = &piece[i..i + cplen];
                if let Some(&tid) = self.token_to_id.get(ch) {
                    let cand = self.token_logprob[tid as usize] + dp[i + cplen];
                    if cand > dp[i] {
                        dp[i] = cand;
                        back_len[i] = cplen;
                        back_tid[i] = Some(tid);
                    }
                } else {
                    let cand = self.unk_penalty + dp[i + cplen];
                    if cand > dp[i] {
                        dp[i] = cand;
                        back_len[i] = cplen;
                        back_tid[i] = None;
                    }
                }
            } else {
                for &(tid, len) in &matches {
                    let cand = self.token_logprob[tid as usize] + dp[i + len];
                    if cand > dp[i] {
                        dp[i] = cand;
                        back_len[i] = len;
                        back_tid[i] = Some(tid);
                    }
                }
            }
        }

        let mut tokens = Vec::with_capacity(n / 2 + 4);
        let mut i = 0;
        while i < n {
            let len = back_len[i];
            if len == 0 {
                // Unreachable position; advance one codepoint so the loop terminates.
                let cplen = codepoint_len_lossy(bytes, i);
                tokens.push(piece[i..i + cplen].to_string());
                i += cplen;
                continue;
            }
            tokens.push(piece[i..i + len].to_string());
            i += len;
        }
        tokens
    }

    /// Segment with the piece cache: shared read on lookup, exclusive write
    /// on insert.
    fn segment_piece_cached(&self, piece: &str) -> Vec<String> {
        if let Ok(cache) = self.piece_cache.read() {
            if let Some(hit) = cache.get(piece) {
                return hit.clone();
            }
        }
        let seg = self.segment_piece(piece);
        if let Ok(mut cache) = self.piece_cache.write() {
            cache.entry(piece.to_string()).or_insert_with(|| seg.clone());
        }
        seg
    }

    /// Number of cached piece segmentations.
    #[must_use]
    pub fn cached_pieces(&self) -> usize {
        self.piece_cache.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Map segmented token strings to ids.
    ///
    /// Unknown tokens re-split into UTF-8 codepoints when
    /// `fallback_to_chars` is set; codepoints still missing map to the
    /// unknown id, or contribute nothing when no unknown id is configured.
    fn tokens_to_ids(&self, tokens: &[String], out: &mut Vec<u32>) {
        out.reserve(tokens.len());
        for t in tokens {
            if let Some(&id) = self.token_to_id.get(t.as_str()) {
                out.push(id);
                continue;
            }
            if self.fallback_to_chars {
                let bytes = t.as_bytes();
                let mut i = 0;
                while i < bytes.len() {
                    let cplen = codepoint_len_lossy(bytes, i);
                    let ch = &t[i..i + cplen];
                    if let Some(&id) = self.token_to_id.get(ch) {
                        out.push(id);
                    } else if let Some(unk) = self.special_ids.unk_id {
                        out.push(unk);
                    }
                    i += cplen;
                }
            } else if let Some(unk) = self.special_ids.unk_id {
                out.push(unk);
            }
        }
    }

    /// Encode text to token ids.
    ///
    /// Prepends `[cls, bos]` and appends `[sep, eos]` as requested, for
    /// special tokens that resolved to an id.
    #[must_use]
    pub fn encode(
        &self,
        text: &str,
        add_bos: bool,
        add_eos: bool,
        add_cls: bool,
        add_sep: bool,
    ) -> Vec<u32> {
        let mut ids = Vec::with_capacity(text.len() / 2 + 8);

        if add_cls {
            if let Some(id) = self.special_ids.cls_id {
                ids.push(id);
            }
        }
        if add_bos {
            if let Some(id) = self.special_ids.bos_id {
                ids.push(id);
            }
        }

        for piece in Self::pretokenize(text) {
            let tokens = self.segment_piece_cached(&piece);
            self.tokens_to_ids(&tokens, &mut ids);
        }

        if add_sep {
            if let Some(id) = self.special_ids.sep_id {
                ids.push(id);
            }
        }
        if add_eos {
            if let Some(id) = self.special_ids.eos_id {
                ids.push(id);
            }
        }
        ids
    }

    /// Decode token ids to text.
    ///
    /// Out-of-range ids are skipped silently. Every `U+2581` becomes a
    /// space and a single leading space is stripped.
    #[must_use]
    pub fn decode(&self, ids: &[u32], skip_special: bool) -> String {
        let mut s = String::with_capacity(ids.len() * 3);
        for &id in ids {
            let Some(tok) = self.id_to_token.get(id as usize) else {
                continue;
            };
            if skip_special && self.special_ids.contains(id) {
                continue;
            }
            s.push_str(tok);
        }

        let replaced = s.replace(WS_SENTINEL, " ");
        match replaced.strip_prefix(' ') {
            Some(rest) => rest.to_string(),
            None => replaced,
        }
    }

    /// Vocabulary size including appended special tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }

    /// Id for a piece, if present.
    #[must_use]
    pub fn get_token_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Piece for an id, if in range.
    #[must_use]
    pub fn get_token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(id as usize).map(String::as_str)
    }

    /// Log probability for an id, if in range.
    #[must_use]
    pub fn get_logprob(&self, id: u32) -> Option<f64> {
        self.token_logprob.get(id as usize).copied()
    }

    /// Resolved special token ids.
    #[must_use]
    pub fn special_ids(&self) -> &SpecialTokenIds {
        &self.special_ids
    }
}
