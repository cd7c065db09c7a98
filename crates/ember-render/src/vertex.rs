// SPDX-License-Identifier: CEPL-1.0
//! Vertex assembly for geometry uploads.
//!
//! A [`VertexFormat`] names the elements a vertex carries. Elements are
//! always laid out in declaration order (position, color, uv, light,
//! normal), independent of the order the caller writes them in.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct VertexFormat: u8 {
        /// 3 x f32
        const POSITION = 1 << 0;
        /// 4 x u8, normalized
        const COLOR = 1 << 1;
        /// 2 x f32
        const UV = 1 << 2;
        /// 2 x i16 lightmap coordinates
        const LIGHT = 1 << 3;
        /// 3 x f32
        const NORMAL = 1 << 4;

        const POSITION_COLOR = Self::POSITION.bits() | Self::COLOR.bits();
        const POSITION_COLOR_UV = Self::POSITION_COLOR.bits() | Self::UV.bits();
        const POSITION_COLOR_UV_LIGHT_NORMAL = Self::POSITION_COLOR_UV.bits()
            | Self::LIGHT.bits()
            | Self::NORMAL.bits();
    }
}

impl VertexFormat {
    const ORDER: [VertexFormat; 5] = [
        VertexFormat::POSITION,
        VertexFormat::COLOR,
        VertexFormat::UV,
        VertexFormat::LIGHT,
        VertexFormat::NORMAL,
    ];

    fn element_size(element: VertexFormat) -> usize {
        match element {
            e if e == VertexFormat::POSITION => 12,
            e if e == VertexFormat::COLOR => 4,
            e if e == VertexFormat::UV => 8,
            e if e == VertexFormat::LIGHT => 4,
            e if e == VertexFormat::NORMAL => 12,
            _ => 0,
        }
    }

    /// Bytes per vertex.
    pub fn stride(self) -> usize {
        Self::ORDER
            .iter()
            .filter(|e| self.contains(**e))
            .map(|e| Self::element_size(*e))
            .sum()
    }

    /// Byte offset of `element` inside one vertex, if the format has it.
    pub fn offset_of(self, element: VertexFormat) -> Option<usize> {
        if !self.contains(element) {
            return None;
        }
        let mut offset = 0;
        for e in Self::ORDER {
            if e == element {
                return Some(offset);
            }
            if self.contains(e) {
                offset += Self::element_size(e);
            }
        }
        None
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VertexError {
    #[error("vertex format {format:?} has no {element:?} element")]
    NotInFormat {
        format: VertexFormat,
        element: VertexFormat,
    },
    #[error("vertex finished without {missing:?}")]
    Incomplete { missing: VertexFormat },
}

/// Builder-style sink for vertex data. Each element setter returns the
/// consumer so calls chain with `?`.
pub trait VertexConsumer {
    fn format(&self) -> VertexFormat;

    fn pos(&mut self, x: f32, y: f32, z: f32) -> Result<&mut Self, VertexError>;

    fn color(&mut self, r: u8, g: u8, b: u8) -> Result<&mut Self, VertexError> {
        self.color_rgba(r, g, b, 255)
    }

    fn color_rgba(&mut self, r: u8, g: u8, b: u8, a: u8) -> Result<&mut Self, VertexError>;

    fn uv(&mut self, u: f32, v: f32) -> Result<&mut Self, VertexError>;

    fn light(&mut self, u: i16, v: i16) -> Result<&mut Self, VertexError>;

    fn normal(&mut self, x: f32, y: f32, z: f32) -> Result<&mut Self, VertexError>;

    /// Commits the vertex being written. Every element of the format must
    /// have been set since the previous commit.
    fn next_vertex(&mut self) -> Result<&mut Self, VertexError>;

    fn clear(&mut self);

    fn vertex_size(&self) -> usize {
        self.format().stride()
    }

    fn vertex_count(&self) -> usize;
}

#[derive(Clone, Debug)]
pub struct BufferVertexConsumer {
    format: VertexFormat,
    bytes: Vec<u8>,
    pending: Vec<u8>,
    written: VertexFormat,
}

impl BufferVertexConsumer {
    pub fn new(format: VertexFormat) -> Self {
        Self {
            format,
            bytes: Vec::new(),
            pending: vec![0; format.stride()],
            written: VertexFormat::empty(),
        }
    }

    /// Committed vertices, tightly packed.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn put(&mut self, element: VertexFormat, data: &[u8]) -> Result<&mut Self, VertexError> {
        let offset = self
            .format
            .offset_of(element)
            .ok_or(VertexError::NotInFormat {
                format: self.format,
                element,
            })?;
        self.pending[offset..offset + data.len()].copy_from_slice(data);
        self.written |= element;
        Ok(self)
    }
}

impl VertexConsumer for BufferVertexConsumer {
    fn format(&self) -> VertexFormat {
        self.format
    }

    fn pos(&mut self, x: f32, y: f32, z: f32) -> Result<&mut Self, VertexError> {
        self.put(VertexFormat::POSITION, bytemuck::bytes_of(&[x, y, z]))
    }

    fn color_rgba(&mut self, r: u8, g: u8, b: u8, a: u8) -> Result<&mut Self, VertexError> {
        self.put(VertexFormat::COLOR, &[r, g, b, a])
    }

    fn uv(&mut self, u: f32, v: f32) -> Result<&mut Self, VertexError> {
        self.put(VertexFormat::UV, bytemuck::bytes_of(&[u, v]))
    }

    fn light(&mut self, u: i16, v: i16) -> Result<&mut Self, VertexError> {
        self.put(VertexFormat::LIGHT, bytemuck::bytes_of(&[u, v]))
    }

    fn normal(&mut self, x: f32, y: f32, z: f32) -> Result<&mut Self, VertexError> {
        self.put(VertexFormat::NORMAL, bytemuck::bytes_of(&[x, y, z]))
    }

    fn next_vertex(&mut self) -> Result<&mut Self, VertexError> {
        let missing = self.format - self.written;
        if !missing.is_empty() {
            return Err(VertexError::Incomplete { missing });
        }
        self.bytes.extend_from_slice(&self.pending);
        self.pending.fill(0);
        self.written = VertexFormat::empty();
        Ok(self)
    }

    fn clear(&mut self) {
        self.bytes.clear();
        self.pending.fill(0);
        self.written = VertexFormat::empty();
    }

    fn vertex_count(&self) -> usize {
        match self.format.stride() {
            0 => 0,
            stride => self.bytes.len() / stride,
        }
    }
}
