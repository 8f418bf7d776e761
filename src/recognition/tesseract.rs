use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

use super::{Modality, RawDetection, RecognizeFuture, Recognizer};
use crate::tiling::TileImage;

const DEFAULT_PSM: u32 = 11;

/// Text recognizer backed by the `tesseract` command line tool.
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    languages: String,
    psm: u32,
    dpi: u32,
}

impl TesseractRecognizer {
    pub fn new(languages: &str, dpi: u32) -> Result<Self> {
        Ok(Self {
            languages: normalize_languages(languages)?,
            psm: DEFAULT_PSM,
            dpi: dpi.max(1),
        })
    }

    pub fn with_psm(mut self, psm: u32) -> Self {
        self.psm = psm;
        self
    }

    fn recognize_blocking(&self, bytes: &[u8]) -> Result<Vec<RawDetection>> {
        let image =
            image::load_from_memory(bytes).with_context(|| "failed to decode tile for OCR")?;
        let gray = image::DynamicImage::ImageLuma8(image.to_luma8());
        let mut tmp = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .with_context(|| "failed to create temp file for OCR")?;
        gray.write_to(&mut tmp, image::ImageFormat::Png)
            .with_context(|| "failed to write temp image for OCR")?;
        tmp.flush().ok();

        let tsv = run_tesseract_tsv(tmp.path(), &self.languages, self.psm, self.dpi)?;
        Ok(parse_tsv(&tsv))
    }
}

impl Recognizer for TesseractRecognizer {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn modality(&self) -> Modality {
        Modality::Ocr
    }

    fn recognize<'a>(&'a self, tile: &'a TileImage) -> RecognizeFuture<'a> {
        Box::pin(async move {
            let this = self.clone();
            let bytes = tile.bytes.clone();
            let detections = tokio::task::spawn_blocking(move || this.recognize_blocking(&bytes))
                .await
                .with_context(|| "tesseract worker panicked")??;
            debug!(
                "tesseract found {} text runs in tile {}",
                detections.len(),
                tile.spec.index
            );
            Ok(detections)
        })
    }
}

fn list_languages() -> Result<Vec<String>> {
    let output = Command::new("tesseract")
        .arg("--list-langs")
        .output()
        .with_context(|| "failed to run tesseract --list-langs")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("tesseract --list-langs failed: {}", stderr.trim()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect())
}

fn normalize_languages(requested: &str) -> Result<String> {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("ocr languages is empty"));
    }

    let available = match list_languages() {
        Ok(list) => list,
        Err(_) => return Ok(trimmed.to_string()),
    };

    let (chosen, missing): (Vec<&str>, Vec<&str>) = trimmed
        .split(['+', ',', ' '])
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .partition(|lang| available.iter().any(|value| value == lang));

    if chosen.is_empty() {
        return Err(anyhow!(
            "ocr language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        ));
    }
    if !missing.is_empty() {
        warn!(
            "ocr language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        );
    }
    Ok(chosen.join("+"))
}

fn run_tesseract_tsv(path: &Path, languages: &str, psm: u32, dpi: u32) -> Result<String> {
    let output = Command::new("tesseract")
        .arg(path)
        .arg("stdout")
        .arg("-l")
        .arg(languages)
        .arg("--oem")
        .arg("1")
        .arg("--psm")
        .arg(psm.to_string())
        .arg("--dpi")
        .arg(dpi.to_string())
        .arg("tsv")
        .output()
        .with_context(|| "failed to run tesseract (is it installed?)")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("tesseract failed: {}", stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[derive(Debug, Clone)]
struct Word {
    text: String,
    left: u32,
    top: u32,
    width: u32,
    height: u32,
    conf: f32,
}

impl Word {
    fn right(&self) -> u32 {
        self.left + self.width
    }

    fn center_y(&self) -> f32 {
        self.top as f32 + self.height as f32 * 0.5
    }
}

/// Groups word-level tsv rows into text runs, one detection per run.
fn parse_tsv(tsv: &str) -> Vec<RawDetection> {
    let mut lines: BTreeMap<(i32, i32, i32, i32), Vec<Word>> = BTreeMap::new();

    for row in tsv.lines().skip(1) {
        let cols = row.split('\t').collect::<Vec<_>>();
        if cols.len() < 12 {
            continue;
        }
        let level: i32 = cols[0].parse().unwrap_or(0);
        if level != 5 {
            continue;
        }
        let key = (
            cols[1].parse().unwrap_or(0),
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        let conf: f32 = cols[10].parse().unwrap_or(-1.0);
        let text = cols[11].trim();
        if text.is_empty() || conf < 0.0 {
            continue;
        }
        lines.entry(key).or_default().push(Word {
            text: text.to_string(),
            left: cols[6].parse().unwrap_or(0),
            top: cols[7].parse().unwrap_or(0),
            width: cols[8].parse().unwrap_or(0),
            height: cols[9].parse().unwrap_or(0),
            conf,
        });
    }

    let mut detections = Vec::new();
    for (_, mut words) in lines {
        words.sort_by_key(|word| word.left);
        for segment in split_segments(words) {
            if let Some(detection) = build_detection(&segment) {
                detections.push(detection);
            }
        }
    }
    detections
}

/// Splits a tesseract line where words are far apart horizontally or drift
/// vertically; drawings pack unrelated labels onto one baseline.
fn split_segments(words: Vec<Word>) -> Vec<Vec<Word>> {
    if words.len() <= 1 {
        return if words.is_empty() { Vec::new() } else { vec![words] };
    }

    let mut heights = words.iter().map(|word| word.height).collect::<Vec<_>>();
    heights.sort_unstable();
    let median_h = heights[heights.len() / 2].max(1) as f32;
    let gap_threshold = (median_h * 1.5).clamp(8.0, 120.0);
    let vertical_threshold = (median_h * 0.9).clamp(6.0, 80.0);

    let mut segments: Vec<Vec<Word>> = Vec::new();
    let mut current: Vec<Word> = Vec::new();
    let mut last_right = 0u32;
    let mut last_center_y = 0f32;
    for word in words {
        if current.is_empty() {
            last_right = word.right();
            last_center_y = word.center_y();
            current.push(word);
            continue;
        }
        let gap = word.left.saturating_sub(last_right);
        let vertical_gap = (word.center_y() - last_center_y).abs();
        if gap as f32 > gap_threshold || vertical_gap > vertical_threshold {
            last_right = word.right();
            last_center_y = word.center_y();
            segments.push(std::mem::replace(&mut current, vec![word]));
        } else {
            last_right = last_right.max(word.right());
            last_center_y = (last_center_y + word.center_y()) * 0.5;
            current.push(word);
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn build_detection(words: &[Word]) -> Option<RawDetection> {
    let text = words
        .iter()
        .map(|word| word.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    if text.trim().is_empty() {
        return None;
    }

    let left = words.iter().map(|word| word.left).min()?;
    let top = words.iter().map(|word| word.top).min()?;
    let right = words.iter().map(Word::right).max()?;
    let bottom = words.iter().map(|word| word.top + word.height).max()?;

    let mut conf_sum = 0.0;
    let mut weight_sum = 0.0;
    for word in words {
        let weight = word.text.chars().count().max(1) as f32;
        conf_sum += word.conf * weight;
        weight_sum += weight;
    }
    let confidence = if weight_sum > 0.0 {
        (conf_sum / weight_sum / 100.0).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Some(RawDetection {
        text: Some(text),
        bbox: vec![left as f64, top as f64, right as f64, bottom as f64],
        confidence: Some(confidence as f64),
        ..RawDetection::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn row(line: i32, word: i32, left: u32, top: u32, width: u32, conf: f32, text: &str) -> String {
        format!("5\t1\t1\t1\t{line}\t{word}\t{left}\t{top}\t{width}\t20\t{conf}\t{text}")
    }

    #[test]
    fn words_on_a_line_form_one_run() {
        let tsv = [
            HEADER.to_string(),
            "4\t1\t1\t1\t1\t0\t10\t10\t120\t20\t-1\t".to_string(),
            row(1, 1, 10, 10, 40, 90.0, "C30"),
            row(1, 2, 56, 11, 60, 80.0, "concrete"),
        ]
        .join("\n");
        let detections = parse_tsv(&tsv);
        assert_eq!(detections.len(), 1);
        let run = &detections[0];
        assert_eq!(run.text.as_deref(), Some("C30 concrete"));
        assert_eq!(run.bbox, vec![10.0, 10.0, 116.0, 31.0]);
        let confidence = run.confidence.unwrap();
        assert!((confidence - (0.9 * 3.0 + 0.8 * 8.0) / 11.0).abs() < 1e-4);
    }

    #[test]
    fn distant_labels_are_split() {
        let tsv = [
            HEADER.to_string(),
            row(1, 1, 10, 10, 30, 95.0, "KZ1"),
            row(1, 2, 400, 10, 30, 91.0, "KL2"),
            row(2, 1, 10, 80, 30, -1.0, "noise"),
        ]
        .join("\n");
        let detections = parse_tsv(&tsv);
        let texts = detections
            .iter()
            .filter_map(|detection| detection.text.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["KZ1", "KL2"]);
    }

    #[test]
    fn empty_output_yields_nothing() {
        assert!(parse_tsv(HEADER).is_empty());
        assert!(parse_tsv("").is_empty());
    }
}
