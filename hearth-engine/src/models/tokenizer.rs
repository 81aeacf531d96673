use anyhow::Result;
use tokenizers::Tokenizer;

/// Turns a growing token sequence into text without splitting multi-byte
/// characters across token boundaries.
///
/// The decoded suffix is held back while it ends in a replacement character,
/// which is how the tokenizer renders an incomplete UTF-8 sequence.
pub struct IncrementalDecoder<'a> {
    tokenizer: &'a Tokenizer,
    tokens: Vec<u32>,
    emitted: usize,
}

impl<'a> IncrementalDecoder<'a> {
    pub fn new(tokenizer: &'a Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            emitted: 0,
        }
    }

    /// Append a token, returning any newly completed text.
    pub fn push(&mut self, token: u32) -> Result<Option<String>> {
        self.tokens.push(token);
        let text = self.decode()?;
        if text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        Ok(self.take_delta(&text))
    }

    /// Flush whatever remains once generation has ended.
    pub fn finish(&mut self) -> Result<Option<String>> {
        let text = self.decode()?;
        Ok(self.take_delta(&text))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn decode(&self) -> Result<String> {
        self.tokenizer
            .decode(&self.tokens, true)
            .map_err(|e| anyhow::anyhow!("Tokenizer decode error: {}", e))
    }

    fn take_delta(&mut self, text: &str) -> Option<String> {
        if text.len() <= self.emitted || !text.is_char_boundary(self.emitted) {
            return None;
        }
        let delta = text[self.emitted..].to_string();
        self.emitted = text.len();
        Some(delta)
    }
}
