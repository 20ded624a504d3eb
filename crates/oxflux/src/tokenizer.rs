use std::path::Path;

use tokenizers::decoders::bpe::BPEDecoder;
use tokenizers::models::bpe::BPE;
use tokenizers::normalizers::Lowercase;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::pre_tokenizers::sequence::Sequence;
use tokenizers::pre_tokenizers::whitespace::WhitespaceSplit;
use tracing::debug;

use crate::error::{FluxError, Result};

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const VOCAB_FILE: &str = "vocab.json";
pub const MERGES_FILE: &str = "merges.txt";

/// Context length of the CLIP text encoder.
pub const CLIP_MAX_LENGTH: usize = 77;
/// Prompt length the FLUX pipeline feeds to T5.
pub const T5_MAX_LENGTH: usize = 512;

const CLIP_BOS: &str = "<|startoftext|>";
const CLIP_EOS: &str = "<|endoftext|>";
const CLIP_END_OF_WORD: &str = "</w>";

const T5_PAD: &str = "<pad>";
const T5_EOS: &str = "</s>";

fn load_tokenizer_json(path: &Path) -> Result<tokenizers::Tokenizer> {
    tokenizers::Tokenizer::from_file(path)
        .map_err(|e| FluxError::Tokenizer(format!("Failed to load {}: {e}", path.display())))
}

fn encode_plain(inner: &tokenizers::Tokenizer, text: &str) -> Result<Vec<u32>> {
    let encoding = inner
        .encode(text, false)
        .map_err(|e| FluxError::Tokenizer(format!("Encode failed: {e}")))?;
    Ok(encoding.get_ids().to_vec())
}

/// CLIP BPE tokenizer producing fixed-length `[bos] tokens [eos] pad...` ids.
pub struct ClipTokenizer {
    inner: tokenizers::Tokenizer,
    bos_id: u32,
    eos_id: u32,
    max_length: usize,
}

impl ClipTokenizer {
    /// Load from `tokenizer.json`, or from `vocab.json` + `merges.txt`.
    pub fn from_pretrained(dir: impl AsRef<Path>, max_length: usize) -> Result<Self> {
        let dir = dir.as_ref();
        let json = dir.join(TOKENIZER_FILE);
        let inner = if json.is_file() {
            load_tokenizer_json(&json)?
        } else {
            Self::build_bpe(dir)?
        };

        let bos_id = inner
            .token_to_id(CLIP_BOS)
            .ok_or_else(|| FluxError::Tokenizer(format!("Missing {CLIP_BOS} in vocab")))?;
        let eos_id = inner
            .token_to_id(CLIP_EOS)
            .ok_or_else(|| FluxError::Tokenizer(format!("Missing {CLIP_EOS} in vocab")))?;

        if max_length < 2 {
            return Err(FluxError::Tokenizer(format!(
                "max_length {max_length} leaves no room for start and end tokens"
            )));
        }

        debug!(
            "CLIP tokenizer from {} ({} tokens)",
            dir.display(),
            inner.get_vocab_size(true)
        );
        Ok(Self {
            inner,
            bos_id,
            eos_id,
            max_length,
        })
    }

    fn build_bpe(dir: &Path) -> Result<tokenizers::Tokenizer> {
        let vocab = dir.join(VOCAB_FILE);
        let merges = dir.join(MERGES_FILE);
        for path in [&vocab, &merges] {
            if !path.is_file() {
                return Err(FluxError::MissingFile(path.clone()));
            }
        }

        let bpe = BPE::from_file(&vocab.to_string_lossy(), &merges.to_string_lossy())
            .end_of_word_suffix(CLIP_END_OF_WORD.to_string())
            .unk_token(CLIP_EOS.to_string())
            .build()
            .map_err(|e| FluxError::Tokenizer(format!("Failed to build BPE: {e}")))?;

        let mut tokenizer = tokenizers::Tokenizer::new(bpe);
        tokenizer.with_normalizer(Some(Lowercase));
        tokenizer.with_pre_tokenizer(Some(Sequence::new(vec![
            WhitespaceSplit.into(),
            ByteLevel::new(false, true, true).into(),
        ])));
        tokenizer.with_decoder(Some(BPEDecoder::new(CLIP_END_OF_WORD.to_string())));
        Ok(tokenizer)
    }

    /// Encode to exactly `max_length` ids, truncating the text if needed.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut body = encode_plain(&self.inner, text)?;
        body.truncate(self.max_length - 2);

        let mut ids = Vec::with_capacity(self.max_length);
        ids.push(self.bos_id);
        ids.extend(body);
        ids.push(self.eos_id);
        ids.resize(self.max_length, self.eos_id);
        Ok(ids)
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let filtered: Vec<u32> = ids
            .iter()
            .copied()
            .filter(|&id| id != self.bos_id && id != self.eos_id)
            .collect();
        self.inner
            .decode(&filtered, true)
            .map_err(|e| FluxError::Tokenizer(format!("Decode failed: {e}")))
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn bos_token_id(&self) -> u32 {
        self.bos_id
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_id
    }
}

/// T5 tokenizer producing fixed-length `tokens [eos] pad...` ids.
pub struct T5Tokenizer {
    inner: tokenizers::Tokenizer,
    pad_id: u32,
    eos_id: u32,
    max_length: usize,
}

impl T5Tokenizer {
    pub fn from_pretrained(dir: impl AsRef<Path>, max_length: usize) -> Result<Self> {
        let dir = dir.as_ref();
        let json = dir.join(TOKENIZER_FILE);
        if !json.is_file() {
            return Err(FluxError::MissingFile(json));
        }
        let inner = load_tokenizer_json(&json)?;

        if max_length == 0 {
            return Err(FluxError::Tokenizer("max_length must be positive".into()));
        }

        let pad_id = inner
            .token_to_id(T5_PAD)
            .ok_or_else(|| FluxError::Tokenizer(format!("Missing {T5_PAD} in vocab")))?;
        let eos_id = inner
            .token_to_id(T5_EOS)
            .ok_or_else(|| FluxError::Tokenizer(format!("Missing {T5_EOS} in vocab")))?;

        debug!(
            "T5 tokenizer from {} ({} tokens)",
            dir.display(),
            inner.get_vocab_size(true)
        );
        Ok(Self {
            pad_id,
            eos_id,
            inner,
            max_length,
        })
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = encode_plain(&self.inner, text)?;
        ids.truncate(self.max_length - 1);
        ids.push(self.eos_id);
        ids.resize(self.max_length, self.pad_id);
        Ok(ids)
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let filtered: Vec<u32> = ids
            .iter()
            .copied()
            .filter(|&id| id != self.pad_id && id != self.eos_id)
            .collect();
        self.inner
            .decode(&filtered, true)
            .map_err(|e| FluxError::Tokenizer(format!("Decode failed: {e}")))
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_id
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_id
    }
}
