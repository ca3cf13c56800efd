// Copyright (c) 2014-2015 Tero Hänninen, license: MIT

//! Replay cache shared by both renderers.
//!
//! Colors are stored in emission order. Coordinates are not stored: each
//! emission burst records its width and height, and bursts are laid out left
//! to right, wrapping to the next band once a band reaches the image width.
//! That is enough to rebuild every `(x, y)` on replay.

use super::PixelSink;

/// Marks a pixel that was skipped (fully transparent) during decoding.
pub const SKIPPED: i32 = -1;

#[derive(Clone, Debug, Default)]
pub struct PixelCache {
    colors : Vec<i32>,
    run_w  : Vec<u32>,
    run_h  : Vec<u32>,
}

impl PixelCache {
    pub fn new() -> PixelCache {
        PixelCache::default()
    }

    #[inline]
    pub fn push(&mut self, rgb: Option<u32>) {
        self.colors.push(match rgb {
            Some(c) => c as i32,
            None => SKIPPED,
        });
    }

    /// Closes a burst of `w * h` pixels pushed row by row.
    pub fn end_run(&mut self, w: usize, h: usize) {
        self.run_w.push(w as u32);
        self.run_h.push(h as u32);
    }

    pub fn is_empty(&self) -> bool {
        self.run_w.is_empty()
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn clear(&mut self) {
        self.colors.clear();
        self.run_w.clear();
        self.run_h.clear();
    }

    /// Emits the cached pixels of an image `width` pixels wide with its top
    /// left corner at `(x, y)`.
    pub fn replay(&self, x: i32, y: i32, width: u32, sink: &mut dyn PixelSink) {
        let mut ox = 0u32;
        let mut oy = 0u32;
        let mut ci = 0;
        for (&bw, &bh) in self.run_w.iter().zip(&self.run_h) {
            for j in 0 .. bh {
                for i in 0 .. bw {
                    let c = self.colors[ci];
                    ci += 1;
                    if c != SKIPPED {
                        sink.emit(x + (ox + i) as i32, y + (oy + j) as i32, c as u32);
                    }
                }
            }
            ox += bw;
            if ox >= width {
                ox = 0;
                oy += bh;
            }
        }
    }
}

/// Routes decoded pixels to the sink, recording them when caching.
pub(crate) struct Emitter<'a> {
    x     : i32,
    y     : i32,
    sink  : &'a mut dyn PixelSink,
    cache : Option<&'a mut PixelCache>,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(x: i32, y: i32, sink: &'a mut dyn PixelSink,
                      cache: Option<&'a mut PixelCache>) -> Emitter<'a>
    {
        Emitter { x: x, y: y, sink: sink, cache: cache }
    }

    /// `None` is a skipped pixel: cached as such, never emitted.
    #[inline]
    pub(crate) fn pixel(&mut self, px: usize, py: usize, rgb: Option<u32>) {
        if let Some(ref mut cache) = self.cache {
            cache.push(rgb);
        }
        if let Some(c) = rgb {
            self.sink.emit(self.x + px as i32, self.y + py as i32, c);
        }
    }

    #[inline]
    pub(crate) fn end_run(&mut self, w: usize, h: usize) {
        if let Some(ref mut cache) = self.cache {
            cache.end_run(w, h);
        }
    }
}
