//! Word timing from decoder cross-attention: attention weights of the alignment heads are
//! normalised, smoothed and walked with dynamic time warping to find where each token lands in
//! the audio.

use anyhow::Result;
use serde::Deserialize;

use crate::transcriber::WordTiming;

/// Audio positions per second after the encoder's stride-2 convolution.
pub const TOKENS_PER_SECOND: f64 = 50.0;
pub const MEDIAN_FILTER_WIDTH: usize = 7;

const PREPEND_PUNCTUATION: &str = "\"'“¿([{-";
const APPEND_PUNCTUATION: &str = "\"'.。,，!！?？:：”)]}、";

/// `(layer, head)` pairs of the decoder whose cross-attention follows the speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentHeads(Vec<(usize, usize)>);

#[derive(Deserialize)]
struct GenerationConfig {
    #[serde(default)]
    alignment_heads: Option<Vec<(usize, usize)>>,
}

impl AlignmentHeads {
    /// Every head of the upper half of the decoder.
    pub fn upper_half(n_layers: usize, n_heads: usize) -> Self {
        AlignmentHeads(
            (n_layers / 2..n_layers)
                .flat_map(|layer| (0..n_heads).map(move |head| (layer, head)))
                .collect(),
        )
    }

    /// Heads listed in a checkpoint's `generation_config.json`, dropping any that do not exist
    /// in a decoder of the given size. Falls back to [`AlignmentHeads::upper_half`].
    pub fn from_generation_config(json: Option<&str>, n_layers: usize, n_heads: usize) -> Self {
        let listed = json
            .and_then(|json| serde_json::from_str::<GenerationConfig>(json).ok())
            .and_then(|config| config.alignment_heads)
            .unwrap_or_default();
        let heads: Vec<_> = listed
            .into_iter()
            .filter(|&(layer, head)| layer < n_layers && head < n_heads)
            .collect();
        if heads.is_empty() {
            Self::upper_half(n_layers, n_heads)
        } else {
            AlignmentHeads(heads)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.0.iter().copied()
    }
}

/// Turns raw cross-attention scores of several heads (`token x frame` each) into one
/// `token x frame` alignment matrix. Only the first `n_frames` columns carry audio; the first
/// `skip_rows` rows (start-of-transcript tokens) and the last row are dropped.
pub fn attention_matrix(
    heads: &[Vec<Vec<f32>>],
    n_frames: usize,
    skip_rows: usize,
    filter_width: usize,
) -> Vec<Vec<f32>> {
    let mut sum: Vec<Vec<f32>> = Vec::new();
    for scores in heads {
        let mut weights: Vec<Vec<f32>> = scores
            .iter()
            .map(|row| softmax(&row[..n_frames.min(row.len())]))
            .collect();
        standardize_columns(&mut weights);
        let smoothed: Vec<Vec<f32>> = weights
            .iter()
            .map(|row| median_filter(row, filter_width))
            .collect();

        if sum.is_empty() {
            sum = smoothed;
        } else {
            for (acc, row) in sum.iter_mut().zip(&smoothed) {
                for (a, v) in acc.iter_mut().zip(row) {
                    *a += v;
                }
            }
        }
    }
    let n_heads = heads.len().max(1) as f32;
    let end = sum.len().saturating_sub(1);
    sum.into_iter()
        .take(end)
        .skip(skip_rows)
        .map(|row| row.into_iter().map(|v| v / n_heads).collect())
        .collect()
}

fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / total).collect()
}

/// Zero mean and unit variance down each column.
fn standardize_columns(rows: &mut [Vec<f32>]) {
    let n_rows = rows.len();
    let n_cols = rows.first().map_or(0, Vec::len);
    if n_rows == 0 {
        return;
    }
    for col in 0..n_cols {
        let mean = rows.iter().map(|r| r[col]).sum::<f32>() / n_rows as f32;
        let var = rows.iter().map(|r| (r[col] - mean).powi(2)).sum::<f32>() / n_rows as f32;
        let std = var.sqrt();
        for row in rows.iter_mut() {
            row[col] = if std > 0.0 { (row[col] - mean) / std } else { 0.0 };
        }
    }
}

/// Sliding median with reflect padding. Rows not longer than half the window are returned
/// unchanged.
pub fn median_filter(row: &[f32], width: usize) -> Vec<f32> {
    let pad = width / 2;
    if width < 2 || row.len() <= pad {
        return row.to_vec();
    }
    let n = row.len() as isize;
    let at = |i: isize| -> f32 {
        let reflected = if i < 0 {
            -i
        } else if i >= n {
            2 * (n - 1) - i
        } else {
            i
        };
        row[reflected.clamp(0, n - 1) as usize]
    };
    let mut window = vec![0f32; 2 * pad + 1];
    (0..n)
        .map(|center| {
            for (k, slot) in window.iter_mut().enumerate() {
                *slot = at(center + k as isize - pad as isize);
            }
            window.sort_by(f32::total_cmp);
            window[pad]
        })
        .collect()
}

/// Minimum-cost monotonic path through `cost` from the top-left to the bottom-right corner.
/// Returns the row and column index of every step.
pub fn dtw(cost: &[Vec<f32>]) -> (Vec<usize>, Vec<usize>) {
    let n = cost.len();
    let m = cost.first().map_or(0, Vec::len);
    if n == 0 || m == 0 {
        return (Vec::new(), Vec::new());
    }

    let mut acc = vec![vec![f32::INFINITY; m + 1]; n + 1];
    let mut trace = vec![vec![u8::MAX; m + 1]; n + 1];
    acc[0][0] = 0.0;
    for j in 1..=m {
        for i in 1..=n {
            let diag = acc[i - 1][j - 1];
            let up = acc[i - 1][j];
            let left = acc[i][j - 1];
            let (best, step) = if diag < up && diag < left {
                (diag, 0)
            } else if up < diag && up < left {
                (up, 1)
            } else {
                (left, 2)
            };
            acc[i][j] = cost[i - 1][j - 1] + best;
            trace[i][j] = step;
        }
    }
    for step in trace[0].iter_mut() {
        *step = 2;
    }
    for row in trace.iter_mut() {
        row[0] = 1;
    }

    let (mut i, mut j) = (n, m);
    let mut rows = Vec::with_capacity(n + m);
    let mut cols = Vec::with_capacity(n + m);
    while i > 0 || j > 0 {
        rows.push(i.saturating_sub(1));
        cols.push(j.saturating_sub(1));
        match trace[i][j] {
            0 => {
                i -= 1;
                j -= 1;
            }
            1 => i -= 1,
            _ => j -= 1,
        }
    }
    rows.reverse();
    cols.reverse();
    (rows, cols)
}

/// Time, in seconds, at which the path first reaches each row.
pub fn jump_times(rows: &[usize], cols: &[usize]) -> Vec<f64> {
    let mut times = Vec::new();
    let mut previous = None;
    for (&row, &col) in rows.iter().zip(cols) {
        if previous != Some(row) {
            times.push(col as f64 / TOKENS_PER_SECOND);
            previous = Some(row);
        }
    }
    times
}

/// A word and the tokens it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct WordTokens {
    pub text: String,
    pub tokens: Vec<u32>,
}

/// Groups text tokens into words: a word starts at a token that begins with a space, at
/// punctuation and at special tokens (`>= eot_token`). Tokens that only decode to valid text
/// together (split multi-byte characters) are kept together.
pub fn split_words<F>(tokens: &[u32], eot_token: u32, mut decode: F) -> Result<Vec<WordTokens>>
where
    F: FnMut(&[u32]) -> Result<String>,
{
    let mut subwords: Vec<WordTokens> = Vec::new();
    let mut pending: Vec<u32> = Vec::new();
    for &token in tokens {
        pending.push(token);
        let text = decode(&pending)?;
        if !text.contains('\u{FFFD}') {
            subwords.push(WordTokens {
                text,
                tokens: std::mem::take(&mut pending),
            });
        }
    }
    if !pending.is_empty() {
        subwords.push(WordTokens {
            text: decode(&pending)?,
            tokens: pending,
        });
    }

    let mut words: Vec<WordTokens> = Vec::new();
    for subword in subwords {
        let special = subword.tokens.first().is_some_and(|&t| t >= eot_token);
        let starts_word = subword.text.starts_with(' ');
        let trimmed = subword.text.trim();
        let punctuation = !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_punctuation());
        match words.last_mut() {
            Some(last) if !special && !starts_word && !punctuation => {
                last.text.push_str(&subword.text);
                last.tokens.extend(subword.tokens);
            }
            _ => words.push(subword),
        }
    }
    Ok(words)
}

/// Times each word from the jump times of its tokens. `jumps[k]` is when token `k` is reached;
/// a word spans from the jump of its first token to the jump after its last token. Special
/// words (`>= eot_token`) and blank words are left out.
pub fn time_words(words: &[WordTokens], jumps: &[f64], eot_token: u32) -> Vec<WordTiming> {
    if jumps.is_empty() {
        return Vec::new();
    }
    let at = |index: usize| jumps[index.min(jumps.len() - 1)];
    let mut boundary = 0;
    let mut timed = Vec::with_capacity(words.len());
    for word in words {
        let start = at(boundary);
        boundary += word.tokens.len();
        let end = at(boundary);
        let special = word.tokens.first().is_some_and(|&t| t >= eot_token);
        let text = word.text.trim();
        if special || text.is_empty() {
            continue;
        }
        timed.push(WordTiming {
            start,
            end: end.max(start),
            text: text.to_string(),
        });
    }
    timed
}

/// Attaches opening punctuation to the following word and closing punctuation to the
/// preceding one.
pub fn merge_punctuation(words: Vec<WordTiming>) -> Vec<WordTiming> {
    let only = |text: &str, set: &str| !text.is_empty() && text.chars().all(|c| set.contains(c));

    let mut prepended: Vec<WordTiming> = Vec::with_capacity(words.len());
    let mut carry: Option<WordTiming> = None;
    for mut word in words {
        if only(&word.text, PREPEND_PUNCTUATION) && !only(&word.text, APPEND_PUNCTUATION) {
            carry = Some(match carry.take() {
                Some(mut open) => {
                    open.text.push_str(&word.text);
                    open
                }
                None => word,
            });
            continue;
        }
        if let Some(open) = carry.take() {
            word.text = format!("{}{}", open.text, word.text);
            word.start = open.start;
        }
        prepended.push(word);
    }
    prepended.extend(carry);

    let mut merged: Vec<WordTiming> = Vec::with_capacity(prepended.len());
    for word in prepended {
        match merged.last_mut() {
            Some(previous) if only(&word.text, APPEND_PUNCTUATION) => {
                previous.text.push_str(&word.text);
            }
            _ => merged.push(word),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOT: u32 = 100;

    fn fake_decode(tokens: &[u32]) -> Result<String> {
        Ok(tokens
            .iter()
            .map(|t| match t {
                1 => " Octo",
                2 => "puses",
                3 => " have",
                4 => " three",
                5 => " hearts",
                6 => "!",
                _ => "",
            })
            .collect())
    }

    #[test]
    fn dtw_follows_the_cheap_diagonal() {
        // Token 0 is heard in frames 0-1, token 1 in frames 2-3, token 2 in frames 4-5.
        let cost: Vec<Vec<f32>> = (0..3)
            .map(|row| {
                (0..6)
                    .map(|col| if col / 2 == row { -1.0 } else { 1.0 })
                    .collect()
            })
            .collect();
        let (rows, cols) = dtw(&cost);
        assert_eq!(rows.first(), Some(&0));
        assert_eq!(cols.first(), Some(&0));
        assert_eq!(rows.last(), Some(&2));
        assert_eq!(cols.last(), Some(&5));
        assert!(rows.windows(2).all(|w| w[0] <= w[1]));
        assert!(cols.windows(2).all(|w| w[0] <= w[1]));

        let jumps = jump_times(&rows, &cols);
        assert_eq!(jumps, vec![0.0, 2.0 / TOKENS_PER_SECOND, 4.0 / TOKENS_PER_SECOND]);
    }

    #[test]
    fn median_filter_removes_spikes_and_keeps_length() {
        let row = [0.0, 0.0, 0.0, 9.0, 0.0, 0.0, 0.0, 0.0];
        let filtered = median_filter(&row, 7);
        assert_eq!(filtered.len(), row.len());
        assert!(filtered.iter().all(|&v| v == 0.0));

        let short = [1.0, 5.0, 2.0];
        assert_eq!(median_filter(&short, 7), short.to_vec());
        assert_eq!(median_filter(&[3.0, 1.0, 2.0], 3), vec![1.0, 2.0, 1.0]);
    }

    #[test]
    fn attention_matrix_drops_prefix_and_last_rows_and_trims_frames() {
        let head = vec![vec![0.0f32; 10]; 6];
        let matrix = attention_matrix(&[head.clone(), head], 4, 2, MEDIAN_FILTER_WIDTH);
        assert_eq!(matrix.len(), 3);
        assert!(matrix.iter().all(|row| row.len() == 4));
    }

    #[test]
    fn attention_peaks_give_word_times() {
        // Rows: sot, notimestamps, " Octo", "puses", " have", eot. Each text token attends to
        // its own two frames.
        let mut head = vec![vec![0.0f32; 8]; 6];
        for (row, frame) in [(1, 0), (2, 2), (3, 4), (4, 6)] {
            head[row][frame] = 8.0;
            head[row][frame + 1] = 8.0;
        }
        let matrix = attention_matrix(&[head], 8, 1, 1);
        let cost: Vec<Vec<f32>> = matrix
            .iter()
            .map(|row| row.iter().map(|v| -v).collect())
            .collect();
        let (rows, cols) = dtw(&cost);
        let jumps = jump_times(&rows, &cols);

        let words = split_words(&[1, 2, 3, EOT], EOT, fake_decode).unwrap();
        let timed = time_words(&words, &jumps, EOT);
        assert_eq!(timed.len(), 2);
        assert_eq!(timed[0].text, "Octopuses");
        assert_eq!(timed[1].text, "have");
        assert!(timed[0].start < timed[1].start);
        assert!(timed[0].end <= timed[1].start + 1e-9);
    }

    #[test]
    fn tokens_group_into_words() {
        let words = split_words(&[1, 2, 3, 4, 5, 6, EOT], EOT, fake_decode).unwrap();
        let texts: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec![" Octopuses", " have", " three", " hearts", "!", ""]);
        assert_eq!(words[0].tokens, vec![1, 2]);
        assert_eq!(words.last().unwrap().tokens, vec![EOT]);
    }

    #[test]
    fn split_characters_stay_together() {
        let decode = |tokens: &[u32]| -> Result<String> {
            Ok(match tokens {
                [7] => "\u{FFFD}".to_string(),
                [7, 8] => " é".to_string(),
                _ => String::new(),
            })
        };
        let words = split_words(&[7, 8], EOT, decode).unwrap();
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].tokens, vec![7, 8]);
    }

    #[test]
    fn words_are_timed_from_token_jumps() {
        let words = split_words(&[1, 2, 3, EOT], EOT, fake_decode).unwrap();
        // One jump per row: notimestamps, Octo, puses, have.
        let jumps = [0.0, 0.4, 0.9, 1.3];
        let timed = time_words(&words, &jumps, EOT);
        assert_eq!(
            timed,
            vec![
                WordTiming {
                    start: 0.0,
                    end: 0.9,
                    text: "Octopuses".to_string()
                },
                WordTiming {
                    start: 0.9,
                    end: 1.3,
                    text: "have".to_string()
                },
            ]
        );
    }

    #[test]
    fn punctuation_joins_its_neighbours() {
        let word = |start: f64, end: f64, text: &str| WordTiming {
            start,
            end,
            text: text.to_string(),
        };
        let merged = merge_punctuation(vec![
            word(0.0, 0.2, "("),
            word(0.2, 0.6, "wow"),
            word(0.6, 0.7, ")"),
            word(0.7, 1.0, "hearts"),
            word(1.0, 1.1, "!"),
        ]);
        assert_eq!(
            merged,
            vec![word(0.0, 0.6, "(wow)"), word(0.7, 1.0, "hearts!")]
        );
    }

    #[test]
    fn alignment_heads_from_generation_config() {
        let json = r#"{"alignment_heads": [[2, 2], [3, 0], [9, 1]], "max_length": 448}"#;
        let heads = AlignmentHeads::from_generation_config(Some(json), 4, 6);
        assert_eq!(heads.iter().collect::<Vec<_>>(), vec![(2, 2), (3, 0)]);

        let fallback = AlignmentHeads::from_generation_config(None, 4, 2);
        assert_eq!(
            fallback.iter().collect::<Vec<_>>(),
            vec![(2, 0), (2, 1), (3, 0), (3, 1)]
        );
        assert_eq!(
            AlignmentHeads::from_generation_config(Some("{}"), 4, 2),
            fallback
        );
    }
}
