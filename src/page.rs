use image::GrayImage;
use serde::{Deserialize, Serialize};

pub const POINTS_PER_INCH: f64 = 72.0;

// Synthetic layout for plain-text sources that have no geometry of their own.
const PLAIN_LINE_HEIGHT_PT: f64 = 12.0;
const PLAIN_CHAR_WIDTH_PT: f64 = 6.0;
const PLAIN_MARGIN_PT: f64 = 36.0;

/// Axis-aligned box in PDF points, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn from_corners(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x: x_min.min(x_max),
            y: y_min.min(y_max),
            width: (x_max - x_min).abs(),
            height: (y_max - y_min).abs(),
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn center_y(&self) -> f64 {
        self.y + self.height / 2.0
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::from_corners(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Converts to raster pixels, rounding outward so the box fully covers
    /// the glyphs it came from.
    pub fn to_pixels(&self, pixels_per_point: f64) -> PixelRect {
        let left = (self.x * pixels_per_point).floor().max(0.0);
        let top = (self.y * pixels_per_point).floor().max(0.0);
        let right = (self.right() * pixels_per_point).ceil().max(left + 1.0);
        let bottom = (self.bottom() * pixels_per_point).ceil().max(top + 1.0);
        PixelRect {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Overflow-safe bounds check against a `width` x `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x.checked_add(self.width).is_some_and(|right| right <= width)
            && self.y.checked_add(self.height).is_some_and(|bottom| bottom <= height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center_y(&self) -> f64 {
        self.y as f64 + self.height as f64 / 2.0
    }

    pub fn contains(&self, other: &PixelRect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn shrink(&self, margin: u32) -> Option<PixelRect> {
        let doubled = margin.checked_mul(2)?;
        if self.width <= doubled || self.height <= doubled {
            return None;
        }
        Some(PixelRect {
            x: self.x + margin,
            y: self.y + margin,
            width: self.width - doubled,
            height: self.height - doubled,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextWord {
    pub text: String,
    pub bbox: BoundingBox,
    /// Byte offset of the word inside its line's `text`.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLine {
    pub text: String,
    pub words: Vec<TextWord>,
}

impl TextLine {
    pub fn word_at(&self, offset: usize) -> Option<&TextWord> {
        self.words
            .iter()
            .find(|word| offset >= word.offset && offset < word.offset + word.text.len())
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        let mut words = self.words.iter();
        let first = words.next()?.bbox;
        Some(words.fold(first, |acc, word| acc.union(&word.bbox)))
    }
}

pub struct PageRaster {
    pub image: GrayImage,
    pub dpi: f64,
}

impl PageRaster {
    pub fn pixels_per_point(&self) -> f64 {
        self.dpi / POINTS_PER_INCH
    }
}

pub struct PageContent {
    /// 1-based page number.
    pub page: u32,
    pub lines: Vec<TextLine>,
    pub raster: Option<PageRaster>,
}

impl PageContent {
    pub fn text_boxes(&self) -> impl Iterator<Item = BoundingBox> + '_ {
        self.lines
            .iter()
            .flat_map(|line| line.words.iter().map(|word| word.bbox))
    }
}

pub fn points_to_pixels(points: f64, dpi: f64) -> f64 {
    points * dpi / POINTS_PER_INCH
}

/// Lays plain text out on a fixed grid so every line still has an anchor.
pub fn lines_from_plain_text(text: &str) -> Vec<TextLine> {
    text.lines()
        .enumerate()
        .map(|(index, raw)| {
            let line = raw.trim_end_matches('\r');
            let y = PLAIN_MARGIN_PT + index as f64 * PLAIN_LINE_HEIGHT_PT;
            let words = split_words_with_offsets(line)
                .into_iter()
                .map(|(offset, word)| {
                    let column = line[..offset].chars().count() as f64;
                    TextWord {
                        text: word.to_string(),
                        bbox: BoundingBox {
                            x: PLAIN_MARGIN_PT + column * PLAIN_CHAR_WIDTH_PT,
                            y,
                            width: word.chars().count() as f64 * PLAIN_CHAR_WIDTH_PT,
                            height: PLAIN_LINE_HEIGHT_PT,
                        },
                        offset,
                    }
                })
                .collect();
            TextLine {
                text: line.to_string(),
                words,
            }
        })
        .collect()
}

/// Groups positioned words into reading-order lines. Gaps wider than two
/// average glyph widths become a double space so column layouts survive.
pub fn lines_from_words(mut words: Vec<(String, BoundingBox)>) -> Vec<TextLine> {
    words.retain(|(text, _)| !text.trim().is_empty());
    words.sort_by(|a, b| {
        a.1.center_y()
            .total_cmp(&b.1.center_y())
            .then(a.1.x.total_cmp(&b.1.x))
    });

    let mut grouped = Vec::<Vec<(String, BoundingBox)>>::new();
    for word in words {
        let joins_last = grouped
            .last()
            .and_then(|line| line.last())
            .map(|(_, previous)| {
                let tolerance = previous.height.min(word.1.height) / 2.0;
                (previous.center_y() - word.1.center_y()).abs() <= tolerance
            })
            .unwrap_or(false);

        match grouped.last_mut() {
            Some(line) if joins_last => line.push(word),
            _ => grouped.push(vec![word]),
        }
    }

    grouped
        .into_iter()
        .map(|mut line_words| {
            line_words.sort_by(|a, b| a.1.x.total_cmp(&b.1.x));
            let mut text = String::new();
            let mut words = Vec::with_capacity(line_words.len());
            let mut previous: Option<(BoundingBox, usize)> = None;

            for (word_text, bbox) in line_words {
                if let Some((previous_box, previous_chars)) = previous {
                    let glyph_width = previous_box.width / previous_chars.max(1) as f64;
                    let gap = bbox.x - previous_box.right();
                    text.push_str(if gap > glyph_width * 2.0 { "  " } else { " " });
                }
                let offset = text.len();
                text.push_str(&word_text);
                previous = Some((bbox, word_text.chars().count()));
                words.push(TextWord {
                    text: word_text,
                    bbox,
                    offset,
                });
            }

            TextLine { text, words }
        })
        .collect()
}

fn split_words_with_offsets(line: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut start: Option<usize> = None;

    for (index, character) in line.char_indices() {
        if character.is_whitespace() {
            if let Some(word_start) = start.take() {
                words.push((word_start, &line[word_start..index]));
            }
        } else if start.is_none() {
            start = Some(index);
        }
    }
    if let Some(word_start) = start {
        words.push((word_start, &line[word_start..]));
    }

    words
}
