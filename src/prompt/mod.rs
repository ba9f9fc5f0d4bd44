//! Text prompt construction and encoding.

use ndarray::{concatenate, Array2, Array3, Axis};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use crate::error::{Error, Result};
use crate::model::session::{extract_array2, extract_array3, missing_output, require_outputs};

/// CLIP context length.
pub const MAX_TOKENS: usize = 77;

/// Negative prompt used for classifier-free guidance.
pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "monochrome, lowres, bad anatomy, worst quality, low quality";

/// Prompt describing the person wearing the garment.
#[must_use]
pub fn tryon_prompt(description: &str) -> String {
    format!("model is wearing {description}")
}

/// Prompt describing the garment on its own.
#[must_use]
pub fn garment_prompt(description: &str) -> String {
    format!("a photo of {description}")
}

/// Sequence and pooled embeddings for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct TextCondition {
    /// `(1, tokens, features)` per-token embeddings.
    pub hidden: Array3<f32>,
    /// `(1, features)` pooled embedding.
    pub pooled: Array2<f32>,
}

/// A prompt's embeddings, with the negative branch when guidance is used.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptEmbeddings {
    pub positive: TextCondition,
    pub negative: Option<TextCondition>,
}

/// Maps text to conditioning embeddings.
pub trait PromptEncoder: Send {
    /// Encode `prompt`, and `negative` when classifier-free guidance needs it.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or inference fails.
    fn encode(&mut self, prompt: &str, negative: Option<&str>) -> Result<PromptEmbeddings>;
}

/// One CLIP tokenizer + text encoder pair.
pub struct ClipTextEncoder {
    tokenizer: Tokenizer,
    session: Session,
    pad_id: u32,
    hidden_output: &'static str,
    pooled_output: Option<&'static str>,
}

impl ClipTextEncoder {
    /// First SDXL encoder (CLIP ViT-L): penultimate hidden layer only.
    ///
    /// # Errors
    ///
    /// Returns an error if the session lacks the hidden-state output.
    pub fn primary(tokenizer: Tokenizer, session: Session) -> Result<Self> {
        Self {
            tokenizer,
            session,
            pad_id: 49407,
            hidden_output: "hidden_states.11",
            pooled_output: None,
        }
        .checked("text_encoder")
    }

    /// Second SDXL encoder (OpenCLIP bigG): penultimate hidden layer and
    /// projected pooled embedding.
    ///
    /// # Errors
    ///
    /// Returns an error if the session lacks either output.
    pub fn secondary(tokenizer: Tokenizer, session: Session) -> Result<Self> {
        Self {
            tokenizer,
            session,
            pad_id: 0,
            hidden_output: "hidden_states.31",
            pooled_output: Some("text_embeds"),
        }
        .checked("text_encoder_2")
    }

    fn checked(self, model: &str) -> Result<Self> {
        require_outputs(&self.session, model, &[self.hidden_output])?;
        if let Some(pooled) = self.pooled_output {
            require_outputs(&self.session, model, &[pooled])?;
        }
        Ok(self)
    }

    fn token_ids(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|source| Error::Tokenize { source })?;
        Ok(pad_tokens(encoding.get_ids(), self.pad_id))
    }

    fn run(&mut self, text: &str) -> Result<(Array3<f32>, Option<Array2<f32>>)> {
        let ids = ndarray::Array2::from_shape_vec((1, MAX_TOKENS), self.token_ids(text)?)
            .map_err(|_| Error::ShapeMismatch {
                expected: format!("{MAX_TOKENS} tokens"),
                actual: "padding failed".to_string(),
            })?;
        let ids_value = Tensor::from_array(ids).map_err(|source| Error::Inference { source })?;

        let outputs = self
            .session
            .run(ort::inputs!["input_ids" => ids_value])
            .map_err(|source| Error::Inference { source })?;

        // Output names were checked when the encoder was built.
        let hidden = extract_array3(&outputs[self.hidden_output])?;
        let pooled = match self.pooled_output {
            Some(name) => Some(extract_array2(&outputs[name])?),
            None => None,
        };

        Ok((hidden, pooled))
    }
}

/// Truncate to [`MAX_TOKENS`] (keeping the end-of-text token) and pad.
fn pad_tokens(ids: &[u32], pad_id: u32) -> Vec<i64> {
    let mut tokens: Vec<i64> = ids.iter().map(|&id| i64::from(id)).collect();
    if tokens.len() > MAX_TOKENS {
        let end = tokens.last().copied();
        tokens.truncate(MAX_TOKENS);
        if let (Some(end), Some(last)) = (end, tokens.last_mut()) {
            *last = end;
        }
    }
    tokens.resize(MAX_TOKENS, i64::from(pad_id));
    tokens
}

/// SDXL dual-encoder prompt encoding.
pub struct DualClipEncoder {
    primary: ClipTextEncoder,
    secondary: ClipTextEncoder,
}

impl DualClipEncoder {
    #[must_use]
    pub const fn new(primary: ClipTextEncoder, secondary: ClipTextEncoder) -> Self {
        Self { primary, secondary }
    }

    fn condition(&mut self, text: &str) -> Result<TextCondition> {
        let (first, _) = self.primary.run(text)?;
        let (second, pooled) = self.secondary.run(text)?;
        let pooled = pooled.ok_or_else(|| missing_output("pooled text embedding"))?;

        let hidden = concatenate(Axis(2), &[first.view(), second.view()]).map_err(|_| {
            Error::ShapeMismatch {
                expected: "matching token counts".to_string(),
                actual: format!("{:?} and {:?}", first.dim(), second.dim()),
            }
        })?;

        Ok(TextCondition { hidden, pooled })
    }
}

impl PromptEncoder for DualClipEncoder {
    fn encode(&mut self, prompt: &str, negative: Option<&str>) -> Result<PromptEmbeddings> {
        tracing::debug!("Encoding prompt {prompt:?}");
        let positive = self.condition(prompt)?;
        let negative = negative.map(|text| self.condition(text)).transpose()?;
        Ok(PromptEmbeddings { positive, negative })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts() {
        assert_eq!(tryon_prompt("red hoodie"), "model is wearing red hoodie");
        assert_eq!(garment_prompt("red hoodie"), "a photo of red hoodie");
    }

    #[test]
    fn test_pad_short() {
        let tokens = pad_tokens(&[49406, 320, 49407], 49407);
        assert_eq!(tokens.len(), MAX_TOKENS);
        assert_eq!(&tokens[..3], &[49406, 320, 49407]);
        assert!(tokens[3..].iter().all(|&t| t == 49407));
    }

    #[test]
    fn test_truncate_keeps_end_token() {
        let mut ids = vec![49406];
        ids.extend(std::iter::repeat(1000).take(100));
        ids.push(49407);

        let tokens = pad_tokens(&ids, 0);
        assert_eq!(tokens.len(), MAX_TOKENS);
        assert_eq!(tokens[0], 49406);
        assert_eq!(tokens[MAX_TOKENS - 1], 49407);
    }
}
