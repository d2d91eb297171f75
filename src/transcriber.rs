//! Whisper speech-to-text on candle. Segments come from timestamp tokens; word timings come
//! from a second decoder pass aligned against the audio with cross-attention DTW.

use std::path::Path;

use anyhow::{Error as E, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, ops::softmax};
use candle_transformers::models::whisper::{self as m, Config, audio};
use hf_hub::{Repo, RepoType, api::sync::Api};
use rand::SeedableRng;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand_distr::weighted::WeightedIndex;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::audio::load_pcm_16k;
use crate::config::{WhisperConfig, WhisperModel};
use crate::whisper::model::Whisper;
use crate::whisper::timestamps::{
    AlignmentHeads, MEDIAN_FILTER_WIDTH, attention_matrix, dtw, jump_times, merge_punctuation,
    split_words, time_words,
};

/// Seconds per timestamp token step.
const TIMESTAMP_RESOLUTION: f64 = 0.02;

/// A stretch of speech bracketed by two timestamp tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedSpan {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<TimedSpan>,
    /// Filled only by [`Transcriber::transcribe_words`].
    #[serde(default)]
    pub words: Vec<WordTiming>,
}

impl Transcript {
    /// End of the last transcribed segment.
    pub fn duration(&self) -> Option<f64> {
        self.segments.last().map(|s| s.end)
    }
}

/// Cuts the decoded tokens of one window at timestamp tokens (ids above
/// `no_timestamps_token`). Only ids below `eot_token` are text; other special tokens are
/// skipped. Times are relative to the window start and never exceed `window`; text after the
/// last timestamp runs to the end of the window.
pub fn split_on_timestamps<F>(
    tokens: &[u32],
    eot_token: u32,
    no_timestamps_token: u32,
    window: f64,
    mut decode: F,
) -> Result<Vec<TimedSpan>>
where
    F: FnMut(&[u32]) -> Result<String>,
{
    let mut spans = vec![];
    let mut pending = vec![];
    let mut span_start = 0.0;

    for &token in tokens {
        if token > no_timestamps_token {
            let timestamp =
                ((token - no_timestamps_token - 1) as f64 * TIMESTAMP_RESOLUTION).min(window);
            if !pending.is_empty() {
                push_span(&mut spans, &decode(&pending)?, span_start, timestamp);
                pending.clear();
            }
            span_start = timestamp;
        } else if token < eot_token {
            pending.push(token);
        }
    }
    if !pending.is_empty() {
        push_span(&mut spans, &decode(&pending)?, span_start, window);
    }
    Ok(spans)
}

fn push_span(spans: &mut Vec<TimedSpan>, text: &str, start: f64, end: f64) {
    let text = text.trim();
    if !text.is_empty() {
        spans.push(TimedSpan {
            start,
            end: end.max(start),
            text: text.to_string(),
        });
    }
}

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow::anyhow!("no token-id for {token}"))
}

pub struct Transcriber {
    device: Device,
    config: Config,
    mel_filters: Vec<f32>,
    alignment_heads: AlignmentHeads,
    decoder: Decoder,
}

impl Transcriber {
    /// Downloads (or reuses the cached) checkpoint from the Hugging Face hub and loads it.
    pub fn load(model: WhisperModel, settings: &WhisperConfig) -> Result<Self> {
        let device = device(settings.cpu)?;
        let english = settings.is_english();
        let (model_id, revision) = model.model_and_revision(english);
        info!("🤖 Loading Whisper model: {model_id}");

        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));
        let config_filename = repo.get("config.json")?;
        let tokenizer_filename = repo.get("tokenizer.json")?;
        let weights_filename = repo.get("model.safetensors")?;
        // Older checkpoint revisions ship no generation config.
        let generation_config = repo
            .get("generation_config.json")
            .ok()
            .and_then(|path| std::fs::read_to_string(path).ok());

        let config: Config = serde_json::from_str(&std::fs::read_to_string(config_filename)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename).map_err(E::msg)?;
        let mel_filters =
            crate::audio::mel_filters(m::SAMPLE_RATE, m::N_FFT, config.num_mel_bins);
        let alignment_heads = AlignmentHeads::from_generation_config(
            generation_config.as_deref(),
            config.decoder_layers,
            config.decoder_attention_heads,
        );

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_filename], m::DTYPE, &device)?
        };
        let whisper = Whisper::load(&vb, config.clone())?;

        let language_token = if model.is_multilingual_checkpoint(english) {
            let code = if english { "en" } else { settings.language.as_str() };
            Some(token_id(&tokenizer, &format!("<|{code}|>"))?)
        } else {
            None
        };

        let decoder = Decoder::new(whisper, tokenizer, &device, language_token)?;
        Ok(Self {
            device,
            config,
            mel_filters,
            alignment_heads,
            decoder,
        })
    }

    /// Segment-level transcript.
    pub fn transcribe<P: AsRef<Path>>(&mut self, audio_path: P) -> Result<Transcript> {
        self.run(audio_path.as_ref(), false)
    }

    /// Segment-level transcript plus word timings aligned against the audio.
    pub fn transcribe_words<P: AsRef<Path>>(&mut self, audio_path: P) -> Result<Transcript> {
        self.run(audio_path.as_ref(), true)
    }

    fn run(&mut self, audio_path: &Path, with_words: bool) -> Result<Transcript> {
        let pcm_data = load_pcm_16k(audio_path)?;
        debug!("PCM data loaded: {} samples", pcm_data.len());
        let total_frames = pcm_data.len().div_ceil(m::HOP_LENGTH);

        let mel = audio::pcm_to_mel(&self.config, &pcm_data, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(
            mel,
            (
                1,
                self.config.num_mel_bins,
                mel_len / self.config.num_mel_bins,
            ),
            &self.device,
        )?;
        debug!("mel spectrogram: {:?}", mel.dims());

        let heads = with_words.then_some(&self.alignment_heads);
        let (segments, words) = self.decoder.run(&mel, total_frames, heads)?;
        info!(
            segments = segments.len(),
            words = words.len(),
            "transcription complete"
        );
        Ok(Transcript { segments, words })
    }
}

struct Decoder {
    model: Whisper,
    rng: StdRng,
    tokenizer: Tokenizer,
    suppress_tokens: Tensor,
    sot_token: u32,
    transcribe_token: u32,
    eot_token: u32,
    no_speech_token: u32,
    no_timestamps_token: u32,
    language_token: Option<u32>,
}

#[derive(Debug, Clone)]
struct DecodingResult {
    tokens: Vec<u32>,
    avg_logprob: f64,
    no_speech_prob: f64,
    n_start_tokens: usize,
}

impl Decoder {
    fn new(
        model: Whisper,
        tokenizer: Tokenizer,
        device: &Device,
        language_token: Option<u32>,
    ) -> Result<Self> {
        let no_timestamps_token = token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?;
        // Timestamps are always predicted, so the "no timestamps" token is suppressed.
        let suppress_tokens: Vec<f32> = (0..model.config.vocab_size as u32)
            .map(|i| {
                if model.config.suppress_tokens.contains(&i) || i == no_timestamps_token {
                    f32::NEG_INFINITY
                } else {
                    0f32
                }
            })
            .collect();
        let suppress_tokens = Tensor::new(suppress_tokens.as_slice(), device)?;
        let sot_token = token_id(&tokenizer, m::SOT_TOKEN)?;
        let transcribe_token = token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?;
        let eot_token = token_id(&tokenizer, m::EOT_TOKEN)?;
        let no_speech_token = m::NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| token_id(&tokenizer, token).ok())
            .ok_or_else(|| anyhow::anyhow!("unable to find any non-speech token"))?;

        Ok(Self {
            model,
            rng: StdRng::seed_from_u64(299792458),
            tokenizer,
            suppress_tokens,
            sot_token,
            transcribe_token,
            eot_token,
            no_speech_token,
            no_timestamps_token,
            language_token,
        })
    }

    fn start_tokens(&self) -> Vec<u32> {
        let mut tokens = vec![self.sot_token];
        tokens.extend(self.language_token);
        tokens.push(self.transcribe_token);
        tokens
    }

    fn decode_with_fallback(&mut self, audio_features: &Tensor) -> Result<DecodingResult> {
        for (i, &t) in m::TEMPERATURES.iter().enumerate() {
            let dr: Result<DecodingResult> = self.decode(audio_features, t);
            if i == m::TEMPERATURES.len() - 1 {
                return dr;
            }
            // On errors, we try again with a different temperature.
            match dr {
                Ok(dr) => {
                    let needs_fallback = dr.avg_logprob < m::LOGPROB_THRESHOLD;
                    if !needs_fallback || dr.no_speech_prob > m::NO_SPEECH_THRESHOLD {
                        return Ok(dr);
                    }
                }
                Err(err) => warn!("error decoding at temperature {t}: {err}"),
            }
        }
        unreachable!()
    }

    /// Decodes 30 s windows of `mel`. `total_frames` is the number of mel frames backed by
    /// real audio. Word timings are produced only when `heads` is given.
    fn run(
        &mut self,
        mel: &Tensor,
        total_frames: usize,
        heads: Option<&AlignmentHeads>,
    ) -> Result<(Vec<TimedSpan>, Vec<WordTiming>)> {
        let (_, _, content_frames) = mel.dims3()?;
        let mut seek = 0;
        let mut spans = vec![];
        let mut words = vec![];

        while seek < content_frames {
            self.model.reset_kv_cache();
            let time_offset = (seek * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
            let segment_size = usize::min(content_frames - seek, m::N_FRAMES);
            let n_frames = segment_size.min(total_frames.saturating_sub(seek));
            let mel_segment = mel.narrow(2, seek, segment_size)?;
            let segment_duration = (segment_size * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
            let audio_features = self.model.encoder.forward(&mel_segment, true)?;
            let dr = self.decode_with_fallback(&audio_features)?;
            seek += segment_size;

            if dr.no_speech_prob > m::NO_SPEECH_THRESHOLD && dr.avg_logprob < m::LOGPROB_THRESHOLD {
                debug!("no speech detected, skipping window at {time_offset:.1}s");
                continue;
            }

            let tokens = &dr.tokens[dr.n_start_tokens..];
            let tokenizer = &self.tokenizer;
            let window = split_on_timestamps(
                tokens,
                self.eot_token,
                self.no_timestamps_token,
                segment_duration,
                |ids| tokenizer.decode(ids, true).map_err(E::msg),
            )?;
            spans.extend(window.into_iter().map(|span| TimedSpan {
                start: span.start + time_offset,
                end: span.end + time_offset,
                text: span.text,
            }));

            if let Some(heads) = heads {
                let text_tokens: Vec<u32> = tokens
                    .iter()
                    .copied()
                    .filter(|&t| t < self.eot_token)
                    .collect();
                let aligned = self.align_words(&audio_features, &text_tokens, n_frames, heads)?;
                words.extend(aligned.into_iter().map(|word| WordTiming {
                    start: word.start + time_offset,
                    end: word.end + time_offset,
                    text: word.text,
                }));
            }
        }

        Ok((spans, words))
    }

    /// Re-runs the decoder over the window's text without timestamps and walks the alignment
    /// heads' cross-attention with DTW. Times are relative to the window start.
    fn align_words(
        &mut self,
        audio_features: &Tensor,
        text_tokens: &[u32],
        n_frames: usize,
        heads: &AlignmentHeads,
    ) -> Result<Vec<WordTiming>> {
        if text_tokens.is_empty() || n_frames < 2 {
            return Ok(Vec::new());
        }
        let mut tokens = self.start_tokens();
        let prefix_len = tokens.len();
        tokens.push(self.no_timestamps_token);
        tokens.extend_from_slice(text_tokens);
        tokens.push(self.eot_token);

        let tokens_t = Tensor::new(tokens.as_slice(), audio_features.device())?.unsqueeze(0)?;
        let (_, cross_qk) =
            self.model
                .decoder
                .forward_with_cross_attention(&tokens_t, audio_features, true)?;
        let scores = heads
            .iter()
            .map(|(layer, head)| -> Result<Vec<Vec<f32>>> {
                let layer_qk = cross_qk
                    .get(layer)
                    .ok_or_else(|| anyhow::anyhow!("no cross-attention for layer {layer}"))?;
                Ok(layer_qk.i((0, head))?.to_dtype(DType::F32)?.to_vec2::<f32>()?)
            })
            .collect::<Result<Vec<_>>>()?;

        let matrix = attention_matrix(&scores, n_frames / 2, prefix_len, MEDIAN_FILTER_WIDTH);
        let cost: Vec<Vec<f32>> = matrix
            .iter()
            .map(|row| row.iter().map(|v| -v).collect())
            .collect();
        let (rows, cols) = dtw(&cost);
        let jumps = jump_times(&rows, &cols);

        let mut word_tokens = text_tokens.to_vec();
        word_tokens.push(self.eot_token);
        let tokenizer = &self.tokenizer;
        let words = split_words(&word_tokens, self.eot_token, |ids| {
            tokenizer.decode(ids, true).map_err(E::msg)
        })?;
        Ok(merge_punctuation(time_words(&words, &jumps, self.eot_token)))
    }

    fn decode(&mut self, audio_features: &Tensor, temperature: f64) -> Result<DecodingResult> {
        let sample_len = self.model.config.max_target_positions / 2;
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut tokens = self.start_tokens();
        let n_start_tokens = tokens.len();

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), audio_features.device())?.unsqueeze(0)?;
            let ys = self
                .model
                .decoder
                .forward(&tokens_t, audio_features, i == 0)?;

            if i == 0 {
                let logits = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                no_speech_prob = softmax(&logits, 0)?
                    .i(self.no_speech_token as usize)?
                    .to_scalar::<f32>()? as f64;
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress_tokens)?;

            let next_token = if temperature > 0f64 {
                let prs = softmax(&(&logits / temperature)?, 0)?;
                let logits_v: Vec<f32> = prs.to_vec1()?;
                let distr = WeightedIndex::new(&logits_v)?;
                distr.sample(&mut self.rng) as u32
            } else {
                let logits_v: Vec<f32> = logits.to_vec1()?;
                logits_v
                    .iter()
                    .enumerate()
                    .max_by(|(_, u), (_, v)| u.total_cmp(v))
                    .map(|(i, _)| i as u32)
                    .ok_or_else(|| anyhow::anyhow!("empty logits"))?
            };

            tokens.push(next_token);
            let prob = softmax(&logits, candle_core::D::Minus1)?
                .i(next_token as usize)?
                .to_scalar::<f32>()? as f64;

            if next_token == self.eot_token || tokens.len() > self.model.config.max_target_positions
            {
                break;
            }
            sum_logprob += prob.ln();
        }

        let avg_logprob = sum_logprob / tokens.len() as f64;
        Ok(DecodingResult {
            tokens,
            avg_logprob,
            no_speech_prob,
            n_start_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Ids as laid out in the English-only checkpoints.
    const EOT: u32 = 50256;
    const SOT: u32 = 50257;
    const TRANSCRIBE: u32 = 50358;
    const NO_TIMESTAMPS: u32 = 50362;

    fn ts(seconds: f64) -> u32 {
        NO_TIMESTAMPS + 1 + (seconds / TIMESTAMP_RESOLUTION).round() as u32
    }

    fn decode(ids: &[u32]) -> Result<String> {
        ids.iter()
            .map(|&id| match id {
                10 => Ok(" Did you"),
                11 => Ok(" know"),
                12 => Ok(" octopuses"),
                13 => Ok("   "),
                other => Err(anyhow::anyhow!("unexpected token {other}")),
            })
            .collect()
    }

    fn split(tokens: &[u32], window: f64) -> Vec<TimedSpan> {
        split_on_timestamps(tokens, EOT, NO_TIMESTAMPS, window, decode).unwrap()
    }

    #[test]
    fn first_timestamp_token_is_zero_seconds() {
        let spans = split(&[NO_TIMESTAMPS + 1, 10, 11, ts(1.5)], 30.0);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 0.0);
        assert!((spans[0].end - 1.5).abs() < 1e-9);
        assert_eq!(spans[0].text, "Did you know");
        assert!((split(&[ts(0.02), 10, ts(0.04)], 30.0)[0].start - 0.02).abs() < 1e-12);
    }

    #[test]
    fn timestamps_are_clamped_to_the_window() {
        let spans = split(&[ts(11.0), 12, ts(20.0)], 12.5);
        assert_eq!(spans.len(), 1);
        assert!((spans[0].start - 11.0).abs() < 1e-9);
        assert_eq!(spans[0].end, 12.5);
    }

    #[test]
    fn trailing_text_runs_to_the_window_end() {
        let spans = split(&[ts(0.0), 10, ts(1.0), ts(1.0), 11, 12], 7.0);
        assert_eq!(spans.len(), 2);
        assert!((spans[1].start - 1.0).abs() < 1e-9);
        assert_eq!(spans[1].end, 7.0);
        assert_eq!(spans[1].text, "know octopuses");
    }

    #[test]
    fn special_tokens_never_reach_the_tokenizer() {
        let spans = split(&[SOT, TRANSCRIBE, ts(0.0), 12, ts(2.0), EOT], 30.0);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "octopuses");
        assert!((spans[0].end - 2.0).abs() < 1e-9);
    }

    #[test]
    fn blank_spans_are_dropped() {
        assert!(split(&[ts(0.0), 13, ts(1.0)], 30.0).is_empty());
        assert!(split(&[], 30.0).is_empty());
    }

    #[test]
    fn duration_is_last_segment_end() {
        let span = |start: f64, end: f64| TimedSpan {
            start,
            end,
            text: "a".to_string(),
        };
        let transcript = Transcript {
            segments: vec![span(0.0, 3.0), span(3.0, 41.7)],
            words: Vec::new(),
        };
        assert_eq!(transcript.duration(), Some(41.7));
        assert_eq!(Transcript::default().duration(), None);
    }

    #[test]
    fn word_timings_serialize_as_start_end_text() {
        let json = serde_json::to_value(WordTiming {
            start: 1.0,
            end: 1.5,
            text: "hello".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"start": 1.0, "end": 1.5, "text": "hello"}));
    }
}
