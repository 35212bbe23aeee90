//! Image geometry and display metadata.
//!
//! [`ImageMetadata`] is the validated form of a server [`MetadataResponse`].
//! Construction rejects inconsistent geometry, so every other component can
//! rely on these invariants:
//!
//! - all five axes have a non-zero extent
//! - there is at least one pyramid level, and level 0 is full resolution
//! - downsample factors strictly increase with the level index
//! - tile shapes are non-zero and never larger than their level

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::BridgeError;
use crate::plane::PlaneKey;
use crate::remote::{ChannelResponse, LevelResponse, MetadataResponse};

use super::DatasetId;

/// Tolerance when checking that level 0 has a downsample factor of 1.
const DOWNSAMPLE_EPSILON: f64 = 1e-9;

// =============================================================================
// Axes
// =============================================================================

/// Axes of an image, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Axis {
    T,
    C,
    Z,
    Y,
    X,
}

/// Axis order of every array view.
pub const AXES: [Axis; 5] = [Axis::T, Axis::C, Axis::Z, Axis::Y, Axis::X];

impl Axis {
    /// Position of this axis in [`AXES`].
    pub fn position(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Axis::T => "T",
            Axis::C => "C",
            Axis::Z => "Z",
            Axis::Y => "Y",
            Axis::X => "X",
        };
        f.write_str(label)
    }
}

// =============================================================================
// Pixel Types
// =============================================================================

/// Element type of the pixels of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float,
    Double,
}

impl PixelType {
    /// Size of one pixel in bytes.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelType::Int8 | PixelType::Uint8 => 1,
            PixelType::Int16 | PixelType::Uint16 => 2,
            PixelType::Int32 | PixelType::Uint32 | PixelType::Float => 4,
            PixelType::Double => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelType::Int8 => "int8",
            PixelType::Uint8 => "uint8",
            PixelType::Int16 => "int16",
            PixelType::Uint16 => "uint16",
            PixelType::Int32 => "int32",
            PixelType::Uint32 => "uint32",
            PixelType::Float => "float",
            PixelType::Double => "double",
        }
    }

    /// Decode one little-endian pixel as `f64`.
    ///
    /// # Panics
    /// Panics if `bytes` is shorter than [`bytes_per_pixel`](Self::bytes_per_pixel).
    pub fn read_f64(self, bytes: &[u8]) -> f64 {
        match self {
            PixelType::Int8 => bytes[0] as i8 as f64,
            PixelType::Uint8 => bytes[0] as f64,
            PixelType::Int16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            PixelType::Uint16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            PixelType::Int32 => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
            }
            PixelType::Uint32 => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
            }
            PixelType::Float => {
                f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
            }
            PixelType::Double => f64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int8" => Ok(PixelType::Int8),
            "uint8" => Ok(PixelType::Uint8),
            "int16" => Ok(PixelType::Int16),
            "uint16" => Ok(PixelType::Uint16),
            "int32" => Ok(PixelType::Int32),
            "uint32" => Ok(PixelType::Uint32),
            "float" | "float32" => Ok(PixelType::Float),
            "double" | "float64" => Ok(PixelType::Double),
            other => Err(BridgeError::Metadata(format!(
                "unsupported pixel type {other:?}"
            ))),
        }
    }
}

// =============================================================================
// Pyramid Levels
// =============================================================================

/// One resolution level of an image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PyramidLevel {
    /// Level index (0 = full resolution)
    pub index: usize,

    /// Downsample factor relative to level 0
    pub downsample: f64,

    /// Height of a plane at this level
    pub size_y: usize,

    /// Width of a plane at this level
    pub size_x: usize,

    /// Native tile height
    pub tile_height: usize,

    /// Native tile width
    pub tile_width: usize,
}

impl PyramidLevel {
    /// Whether one native tile covers the whole plane.
    pub fn is_untiled(&self) -> bool {
        self.tile_height >= self.size_y && self.tile_width >= self.size_x
    }

    /// Number of tiles in Y and X.
    pub fn tile_count(&self) -> (usize, usize) {
        (
            self.size_y.div_ceil(self.tile_height),
            self.size_x.div_ceil(self.tile_width),
        )
    }
}

// =============================================================================
// Channels
// =============================================================================

/// Rendering window of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplayWindow {
    pub start: f64,
    pub end: f64,
    pub min: f64,
    pub max: f64,
}

/// Display settings of one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelInfo {
    pub label: String,
    pub color: [u8; 3],
    pub window: Option<DisplayWindow>,
    pub active: bool,
}

impl ChannelInfo {
    fn from_response(index: usize, response: ChannelResponse) -> Self {
        Self {
            label: response
                .label
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| format!("Channel {index}")),
            color: response.color.unwrap_or([255, 255, 255]),
            window: response.window.map(|w| DisplayWindow {
                start: w.start,
                end: w.end,
                min: w.min,
                max: w.max,
            }),
            active: response.active,
        }
    }

    fn default_for(index: usize) -> Self {
        Self {
            label: format!("Channel {index}"),
            color: [255, 255, 255],
            window: None,
            active: true,
        }
    }
}

// =============================================================================
// Image Metadata
// =============================================================================

/// Validated geometry and display metadata of one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageMetadata {
    pub id: DatasetId,
    pub name: String,
    pub size_t: usize,
    pub size_c: usize,
    pub size_z: usize,
    pub size_y: usize,
    pub size_x: usize,
    pub pixel_type: PixelType,
    pub levels: Vec<PyramidLevel>,
    pub channels: Vec<ChannelInfo>,
    pub default_z: usize,
    pub default_t: usize,
}

impl ImageMetadata {
    /// Validate a server response for the image `id`.
    ///
    /// Images without a pyramid get a single untiled level.
    pub fn from_response(id: DatasetId, response: MetadataResponse) -> Result<Self, BridgeError> {
        if response.id != id.get() {
            return Err(BridgeError::Metadata(format!(
                "requested {id} but the server described Image:{}",
                response.id
            )));
        }

        let size = response.size;
        for (axis, extent) in [
            ("T", size.t),
            ("C", size.c),
            ("Z", size.z),
            ("Y", size.y),
            ("X", size.x),
        ] {
            if extent == 0 {
                return Err(BridgeError::Metadata(format!("axis {axis} has zero extent")));
            }
        }

        let pixel_type: PixelType = response.pixel_type.parse()?;

        let levels = if response.levels.is_empty() {
            vec![PyramidLevel {
                index: 0,
                downsample: 1.0,
                size_y: size.y,
                size_x: size.x,
                tile_height: size.y,
                tile_width: size.x,
            }]
        } else {
            validate_levels(response.levels, size.y, size.x)?
        };

        let channels = if response.channels.is_empty() {
            (0..size.c).map(ChannelInfo::default_for).collect()
        } else if response.channels.len() != size.c {
            return Err(BridgeError::Metadata(format!(
                "{} channels described for an image with C={}",
                response.channels.len(),
                size.c
            )));
        } else {
            response
                .channels
                .into_iter()
                .enumerate()
                .map(|(i, c)| ChannelInfo::from_response(i, c))
                .collect()
        };

        let default_z = response.default_z.unwrap_or(0);
        let default_t = response.default_t.unwrap_or(0);
        if default_z >= size.z || default_t >= size.t {
            return Err(BridgeError::Metadata(format!(
                "default position z={default_z}, t={default_t} lies outside Z={}, T={}",
                size.z, size.t
            )));
        }

        Ok(Self {
            id,
            name: response.name,
            size_t: size.t,
            size_c: size.c,
            size_z: size.z,
            size_y: size.y,
            size_x: size.x,
            pixel_type,
            levels,
            channels,
            default_z,
            default_t,
        })
    }

    /// Shape (T, C, Z, Y, X) at full resolution.
    pub fn shape(&self) -> [usize; 5] {
        [self.size_t, self.size_c, self.size_z, self.size_y, self.size_x]
    }

    /// Shape (T, C, Z, Y, X) at a pyramid level.
    pub fn level_shape(&self, level: usize) -> Option<[usize; 5]> {
        let info = self.levels.get(level)?;
        Some([self.size_t, self.size_c, self.size_z, info.size_y, info.size_x])
    }

    pub fn level(&self, level: usize) -> Option<&PyramidLevel> {
        self.levels.get(level)
    }

    /// The full-resolution level.
    pub fn base_level(&self) -> &PyramidLevel {
        // construction guarantees at least one level
        &self.levels[0]
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Number of bytes the server returns for `key`.
    ///
    /// Fails if the key addresses a level, plane or tile outside the image.
    pub fn expected_bytes(&self, key: &PlaneKey) -> Result<usize, BridgeError> {
        let level = self.levels.get(key.level).ok_or_else(|| {
            BridgeError::UnsupportedIndex(format!(
                "pyramid level {} does not exist ({} levels)",
                key.level,
                self.levels.len()
            ))
        })?;

        for (axis, index, bound) in [
            (Axis::T, key.t, self.size_t),
            (Axis::C, key.c, self.size_c),
            (Axis::Z, key.z, self.size_z),
        ] {
            if index >= bound {
                return Err(BridgeError::Index {
                    axis,
                    index: index as i64,
                    bound,
                });
            }
        }

        let (height, width) = match key.tile {
            None => (level.size_y, level.size_x),
            Some(tile) => {
                if tile.y + tile.height > level.size_y {
                    return Err(BridgeError::Index {
                        axis: Axis::Y,
                        index: (tile.y + tile.height) as i64,
                        bound: level.size_y,
                    });
                }
                if tile.x + tile.width > level.size_x {
                    return Err(BridgeError::Index {
                        axis: Axis::X,
                        index: (tile.x + tile.width) as i64,
                        bound: level.size_x,
                    });
                }
                (tile.height, tile.width)
            }
        };

        Ok(height * width * self.pixel_type.bytes_per_pixel())
    }
}

fn validate_levels(
    levels: Vec<LevelResponse>,
    size_y: usize,
    size_x: usize,
) -> Result<Vec<PyramidLevel>, BridgeError> {
    let mut validated: Vec<PyramidLevel> = Vec::with_capacity(levels.len());

    for (index, level) in levels.into_iter().enumerate() {
        if !level.downsample.is_finite() || level.downsample <= 0.0 {
            return Err(BridgeError::Metadata(format!(
                "level {index} has invalid downsample factor {}",
                level.downsample
            )));
        }

        if level.size_y == 0 || level.size_x == 0 {
            return Err(BridgeError::Metadata(format!(
                "level {index} has an empty plane ({}x{})",
                level.size_y, level.size_x
            )));
        }

        if index == 0 {
            if (level.downsample - 1.0).abs() > DOWNSAMPLE_EPSILON {
                return Err(BridgeError::Metadata(format!(
                    "level 0 must be full resolution, got downsample {}",
                    level.downsample
                )));
            }
            if level.size_y != size_y || level.size_x != size_x {
                return Err(BridgeError::Metadata(format!(
                    "level 0 extent {}x{} differs from image extent {}x{}",
                    level.size_y, level.size_x, size_y, size_x
                )));
            }
        }

        if let Some(previous) = validated.last() {
            if level.downsample <= previous.downsample {
                return Err(BridgeError::Metadata(format!(
                    "pyramid downsample factors must strictly increase: level {index} has {} after {}",
                    level.downsample, previous.downsample
                )));
            }
        }

        let tile_height = level.tile_height.unwrap_or(level.size_y);
        let tile_width = level.tile_width.unwrap_or(level.size_x);
        if tile_height == 0 || tile_width == 0 {
            return Err(BridgeError::Metadata(format!(
                "level {index} has an empty tile shape ({tile_height}x{tile_width})"
            )));
        }

        validated.push(PyramidLevel {
            index,
            downsample: level.downsample,
            size_y: level.size_y,
            size_x: level.size_x,
            tile_height: tile_height.min(level.size_y),
            tile_width: tile_width.min(level.size_x),
        });
    }

    Ok(validated)
}

// =============================================================================
// Tests
// =============================================================================
