//! Built-in lexicon model.
//!
//! A model directory holds one sub-directory per model id containing a
//! tab-separated lexicon (`source<TAB>target`, `#` comments allowed):
//!
//! ```text
//! models/opus-mt-en-fr/lexicon.tsv
//! models/opus-mt-en-fr/lexicon_quantized.tsv   (optional)
//! ```
//!
//! Translation is longest-phrase-first substitution with case carried over
//! from the source word. Unknown words pass through unchanged.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use offline_translate_types::{ErrorKind, TranslateError, TranslateOptions};
use tokio_util::sync::CancellationToken;

use crate::model::{LoadProgress, ModelKey, ModelLoader, SharedModel, Translation, TranslationModel};

const READ_CHUNK: usize = 64 * 1024;

pub struct LexiconLoader {
    model_dir: PathBuf,
}

impl LexiconLoader {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    fn lexicon_path(&self, key: &ModelKey) -> PathBuf {
        let dir = self.model_dir.join(&key.model_id);
        let quantized = dir.join("lexicon_quantized.tsv");
        if key.quantized && quantized.is_file() {
            quantized
        } else {
            dir.join("lexicon.tsv")
        }
    }

    /// Read the file in chunks so progress and cancellation have a checkpoint
    /// per chunk.
    fn read_with_progress(
        path: &Path,
        progress: LoadProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, TranslateError> {
        let load_err = |e: std::io::Error| {
            TranslateError::new(
                ErrorKind::ModelLoadFailed,
                format!("Cannot read {}: {e}", path.display()),
            )
        };
        let mut file = File::open(path).map_err(load_err)?;
        let total = file.metadata().map_err(load_err)?.len().max(1);
        let mut bytes = Vec::with_capacity(total as usize);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if cancel.is_cancelled() {
                return Err(TranslateError::new(ErrorKind::Cancelled, "Model load cancelled"));
            }
            let n = file.read(&mut chunk).map_err(load_err)?;
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..n]);
            // Parsing takes the last 10%.
            let pct = (bytes.len() as u64 * 90 / total).min(90) as u8;
            progress(pct, "Reading lexicon");
        }
        String::from_utf8(bytes).map_err(|e| {
            TranslateError::new(
                ErrorKind::ModelLoadFailed,
                format!("{} is not valid UTF-8: {e}", path.display()),
            )
        })
    }
}

impl ModelLoader for LexiconLoader {
    fn load(
        &self,
        key: &ModelKey,
        progress: LoadProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<SharedModel, TranslateError> {
        let path = self.lexicon_path(key);
        info!("[LEXICON] Loading {key} from {}", path.display());
        let raw = Self::read_with_progress(&path, &mut *progress, cancel)?;
        let model = LexiconModel::parse(&raw);
        progress(100, "Lexicon ready");
        debug!("[LEXICON] {key}: {} entries", model.entries.len());
        Ok(Arc::new(model))
    }

    fn supported_languages(&self) -> Vec<String> {
        // Languages that appear on either side of an installed model.
        let mut codes: Vec<String> = std::fs::read_dir(&self.model_dir)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| {
                let pair = name.strip_prefix("opus-mt-")?;
                let (source, target) = pair.split_once('-')?;
                Some([source.to_string(), target.to_string()])
            })
            .flatten()
            .collect();
        codes.sort();
        codes.dedup();
        if codes.is_empty() {
            offline_translate_types::languages::supported_language_codes()
        } else {
            codes
        }
    }
}

pub struct LexiconModel {
    entries: HashMap<String, String>,
    longest_phrase: usize,
}

impl LexiconModel {
    pub fn parse(raw: &str) -> Self {
        let mut entries = HashMap::new();
        let mut longest_phrase = 1;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((source, target)) = line.split_once('\t') else {
                continue;
            };
            let source = source.trim().to_lowercase();
            if source.is_empty() {
                continue;
            }
            longest_phrase = longest_phrase.max(source.split_whitespace().count());
            entries.insert(source, target.trim().to_string());
        }
        Self {
            entries,
            longest_phrase,
        }
    }
}

impl TranslationModel for LexiconModel {
    fn translate(
        &self,
        text: &str,
        options: &TranslateOptions,
        cancel: &CancellationToken,
    ) -> Result<Translation, TranslateError> {
        let tokens: Vec<Token<'_>> = text.split_whitespace().map(Token::split).collect();
        let mut output: Vec<String> = Vec::with_capacity(tokens.len());
        let mut known = 0usize;
        let mut i = 0;

        while i < tokens.len() {
            if cancel.is_cancelled() {
                return Err(TranslateError::new(ErrorKind::Cancelled, "Translation cancelled"));
            }
            let max_len = self.longest_phrase.min(tokens.len() - i);
            let hit = (1..=max_len).rev().find_map(|len| {
                let phrase = tokens[i..i + len]
                    .iter()
                    .map(|t| t.core.to_lowercase())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.entries.get(&phrase).map(|target| (len, target))
            });

            match hit {
                Some((len, target)) => {
                    let first = &tokens[i];
                    let last = &tokens[i + len - 1];
                    output.push(format!(
                        "{}{}{}",
                        first.lead,
                        match_case(first.core, target),
                        last.trail
                    ));
                    known += len;
                    i += len;
                }
                None => {
                    output.push(tokens[i].whole.to_string());
                    i += 1;
                }
            }
        }

        if let Some(max) = options.max_length {
            output.truncate(max);
        }
        let confidence = if tokens.is_empty() {
            None
        } else {
            Some(known as f32 / tokens.len() as f32)
        };
        Ok(Translation {
            text: output.join(" "),
            confidence,
        })
    }
}

/// A whitespace-separated word split into leading punctuation, core and
/// trailing punctuation.
struct Token<'a> {
    whole: &'a str,
    lead: &'a str,
    core: &'a str,
    trail: &'a str,
}

impl<'a> Token<'a> {
    fn split(whole: &'a str) -> Self {
        let start = whole
            .find(|c: char| c.is_alphanumeric())
            .unwrap_or(whole.len());
        let end = whole
            .rfind(|c: char| c.is_alphanumeric())
            .map(|i| i + whole[i..].chars().next().map_or(1, char::len_utf8))
            .unwrap_or(start)
            .max(start);
        Self {
            whole,
            lead: &whole[..start],
            core: &whole[start..end],
            trail: &whole[end..],
        }
    }
}

fn match_case(source: &str, target: &str) -> String {
    let letters: Vec<char> = source.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() > 1 && letters.iter().all(|c| c.is_uppercase()) {
        return target.to_uppercase();
    }
    if letters.first().is_some_and(|c| c.is_uppercase()) {
        let mut chars = target.chars();
        return match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        };
    }
    target.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EN_FR: &str = "# en -> fr\nhello\tbonjour\nworld\tmonde\ngood morning\tbonjour\nthe\tle\n";

    fn translate(model: &LexiconModel, text: &str) -> Translation {
        model
            .translate(text, &TranslateOptions::default(), &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn test_word_substitution_keeps_case_and_punctuation() {
        let model = LexiconModel::parse(EN_FR);
        let out = translate(&model, "Hello world!");
        assert_eq!(out.text, "Bonjour monde!");
        assert_eq!(out.confidence, Some(1.0));

        let out = translate(&model, "HELLO, stranger");
        assert_eq!(out.text, "BONJOUR, stranger");
        assert_eq!(out.confidence, Some(0.5));
    }

    #[test]
    fn test_longest_phrase_wins() {
        let model = LexiconModel::parse(EN_FR);
        assert_eq!(translate(&model, "Good morning world").text, "Bonjour monde");
    }

    #[test]
    fn test_max_length_truncates() {
        let model = LexiconModel::parse(EN_FR);
        let options = TranslateOptions {
            max_length: Some(1),
            ..TranslateOptions::default()
        };
        let out = model
            .translate("hello world", &options, &CancellationToken::new())
            .unwrap();
        assert_eq!(out.text, "bonjour");
    }

    #[test]
    fn test_cancelled_translation() {
        let model = LexiconModel::parse(EN_FR);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = model
            .translate("hello", &TranslateOptions::default(), &cancel)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[test]
    fn test_loader_reads_model_directory() {
        let dir = std::env::temp_dir().join(format!("ot-lexicon-{}", std::process::id()));
        let model_dir = dir.join("opus-mt-en-fr");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("lexicon.tsv"), EN_FR).unwrap();

        let loader = LexiconLoader::new(&dir);
        let mut seen = Vec::new();
        let model = loader
            .load(
                &ModelKey::new("translation", "opus-mt-en-fr", true),
                &mut |pct, _| seen.push(pct),
                &CancellationToken::new(),
            )
            .ok()
            .unwrap();
        assert_eq!(seen.last(), Some(&100));
        let out = model
            .translate("hello", &TranslateOptions::default(), &CancellationToken::new())
            .unwrap();
        assert_eq!(out.text, "bonjour");

        let mut languages = loader.supported_languages();
        languages.sort();
        assert_eq!(languages, vec!["en", "fr"]);

        let missing = loader.load(
            &ModelKey::new("translation", "opus-mt-en-de", false),
            &mut |_, _| {},
            &CancellationToken::new(),
        );
        assert_eq!(missing.err().unwrap().kind, ErrorKind::ModelLoadFailed);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
