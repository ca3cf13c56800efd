// Copyright (c) 2014-2015 Tero Hänninen, license: MIT
//
//! Streaming baseline JPEG and PNG decoders.
//!
//! Nothing here builds a framebuffer. Decoded pixels go straight to a
//! [`PixelSink`] as `(x, y, 0xRRGGBB)` triples, which suits devices that
//! push pixels to a display controller one at a time.
//!
//! # Example
//!
//! ```no_run
//! use streamdec::{jpeg::JpegRenderer, JpegOptions, Renderer, RenderOptions, Bounds};
//!
//! let mut r = JpegRenderer::new("photo.jpg", JpegOptions { quality: 4, cache: true })
//!     .unwrap();
//!
//! let mut draw = |x: i32, y: i32, rgb: u32| { let _ = (x, y, rgb); };
//!
//! // only decode if it fits on a 320x240 panel
//! let bounds = Bounds { max_width: Some(320), max_height: Some(240), max_area: None };
//! r.check_and_render(&bounds, &RenderOptions::default(), &mut draw).unwrap();
//!
//! // second render replays the cache at a new position without decoding
//! r.render(&RenderOptions { x: 10, y: 10, ..Default::default() }, &mut draw).unwrap();
//! ```

use std::fmt::{self, Debug};
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek};
use std::path::{Path, PathBuf};

pub mod cache;
#[cfg(feature = "png")] pub mod png;
#[cfg(feature = "jpeg")] pub mod jpeg;

/// Holds basic info about an image, read without decoding pixel data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ImageMetadata {
    pub width     : u32,
    pub height    : u32,
    pub bit_depth : u8,
    pub color     : ColType,
    pub format    : Format,
}

/// Color type – these are categories of the source's samples.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ColType {
    Gray,
    GrayAlpha,
    Color,
    ColorAlpha,
    Indexed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Jpeg,
    Png,
}

/// Conventional placeholder color.
pub const PLACEHOLDER_COLOR: u32 = 0xBBBBBB;

/// Receives decoded pixels in device coordinates.
pub trait PixelSink {
    /// `rgb` is packed as `0xRRGGBB`.
    fn emit(&mut self, x: i32, y: i32, rgb: u32);

    /// Called once before a full decode when `RenderOptions::placeholder` is set.
    fn placeholder(&mut self, _x: i32, _y: i32, _w: u32, _h: u32, _rgb: u32) {}
}

impl<F: FnMut(i32, i32, u32)> PixelSink for F {
    #[inline]
    fn emit(&mut self, x: i32, y: i32, rgb: u32) {
        self(x, y, rgb)
    }
}

/// Where the image comes from. Every parse pass opens a fresh reader.
#[derive(Clone)]
pub enum Source {
    File(PathBuf),
    Memory(Vec<u8>),
}

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

impl Source {
    pub fn open(&self) -> Result<Box<dyn ReadSeek + '_>> {
        Ok(match *self {
            Source::File(ref path) => Box::new(BufReader::new(File::open(path)?)),
            Source::Memory(ref buf) => Box::new(Cursor::new(&buf[..])),
        })
    }
}

impl Debug for Source {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Source::File(ref p) => write!(fmt, "Source::File({:?})", p),
            Source::Memory(ref b) => write!(fmt, "Source::Memory([{} bytes])", b.len()),
        }
    }
}

impl<'a> From<&'a Path> for Source {
    fn from(p: &'a Path) -> Source { Source::File(p.to_path_buf()) }
}

impl<'a> From<&'a str> for Source {
    fn from(p: &'a str) -> Source { Source::File(PathBuf::from(p)) }
}

impl From<PathBuf> for Source {
    fn from(p: PathBuf) -> Source { Source::File(p) }
}

impl From<Vec<u8>> for Source {
    fn from(b: Vec<u8>) -> Source { Source::Memory(b) }
}

impl<'a> From<&'a [u8]> for Source {
    fn from(b: &'a [u8]) -> Source { Source::Memory(b.to_vec()) }
}

/// Placement of a render in device space.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RenderOptions {
    pub x : i32,
    pub y : i32,
    /// Color passed to `PixelSink::placeholder` before decoding starts.
    pub placeholder : Option<u32>,
}

/// Limits checked by `check_and_render`. `None` means unbounded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Bounds {
    pub max_width  : Option<u32>,
    pub max_height : Option<u32>,
    pub max_area   : Option<u64>,
}

impl Bounds {
    pub fn admits(&self, meta: &ImageMetadata) -> bool {
        if let Some(w) = self.max_width { if meta.width > w { return false } }
        if let Some(h) = self.max_height { if meta.height > h { return false } }
        if let Some(a) = self.max_area {
            if meta.width as u64 * meta.height as u64 > a { return false }
        }
        true
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JpegOptions {
    /// IDCT precision, 1 to 8. Lower is faster and blurrier.
    pub quality : u8,
    pub cache   : bool,
}

impl Default for JpegOptions {
    fn default() -> JpegOptions {
        JpegOptions { quality: 8, cache: false }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PngOptions {
    pub cache      : bool,
    /// Background that partially transparent pixels are blended against.
    pub bg         : [u8; 3],
    /// Treat any non-zero alpha as opaque instead of blending.
    pub fast_alpha : bool,
}

impl Default for PngOptions {
    fn default() -> PngOptions {
        PngOptions { cache: false, bg: [0, 0, 0], fast_alpha: true }
    }
}

/// The contract both decoders implement.
///
/// A renderer decodes its source once. Later `render` calls replay the pixel
/// cache at the new offset if caching was enabled and fail with
/// `Error::AlreadyRendered` otherwise.
pub trait Renderer {
    /// Parses just enough of the header to report dimensions. `None` means
    /// the source is not an image of this format.
    fn metadata(&mut self) -> Result<Option<ImageMetadata>>;

    fn render(&mut self, opts: &RenderOptions, sink: &mut dyn PixelSink) -> Result<()>;

    /// Renders only if the image fits `bounds`. Returns whether it rendered.
    fn check_and_render(&mut self, bounds: &Bounds, opts: &RenderOptions,
                                            sink: &mut dyn PixelSink)
                                                         -> Result<bool>
    {
        let meta = match self.metadata()? {
            Some(m) => m,
            None => return Ok(false),
        };
        if !bounds.admits(&meta) {
            log::debug!("{}x{} image rejected by {:?}", meta.width, meta.height, bounds);
            return Ok(false);
        }
        self.render(opts, sink)?;
        Ok(true)
    }
}

/// Sniffs the signature of the source.
pub fn detect(source: &Source) -> Result<Option<Format>> {
    let mut reader = source.open()?;
    // both detectors seek back to where they started
    if cfg!(feature = "png") && png::detect(&mut reader) { return Ok(Some(Format::Png)) }
    if cfg!(feature = "jpeg") && jpeg::detect(&mut reader) { return Ok(Some(Format::Jpeg)) }
    Ok(None)
}

/// Returns a renderer for whichever format the source turns out to be.
pub fn open<S: Into<Source>>(source: S, jpeg_opts: JpegOptions, png_opts: PngOptions)
                                               -> Result<Option<Box<dyn Renderer>>>
{
    let source = source.into();
    match detect(&source)? {
        Some(Format::Png) => Ok(Some(png::boxed(source, png_opts)?)),
        Some(Format::Jpeg) => Ok(Some(jpeg::boxed(source, jpeg_opts)?)),
        None => Ok(None),
    }
}

// ------------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    InvalidData(&'static str),
    Unsupported(&'static str),
    InvalidOption(&'static str),
    AlreadyRendered,
    Inflate(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
            Error::InvalidData(s) => write!(f, "invalid data: {}", s),
            Error::Unsupported(s) => write!(f, "unsupported: {}", s),
            Error::InvalidOption(s) => write!(f, "invalid option: {}", s),
            Error::AlreadyRendered => write!(f, "already rendered"),
            Error::Inflate(ref s) => write!(f, "inflate failed: {}", s),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

// ------------------------------------------------------------

trait IFRead {
    fn read_u8(&mut self) -> io::Result<u8>;
}

impl<R: Read + ?Sized> IFRead for R {
    #[inline]
    fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}

#[allow(dead_code)]
fn u16_from_be(buf: &[u8]) -> u16 {
    (buf[0] as u16) << 8 | buf[1] as u16
}

#[allow(dead_code)]
fn u32_from_be(buf: &[u8]) -> u32 {
    (buf[0] as u32) << 24 | (buf[1] as u32) << 16 | (buf[2] as u32) << 8 | buf[3] as u32
}

#[inline]
fn pack_rgb(r: u8, g: u8, b: u8) -> u32 {
    (r as u32) << 16 | (g as u32) << 8 | b as u32
}

macro_rules! dummy_mod {
    ($name:ident, $opts:ident) => {
        #[allow(dead_code)]
        mod $name {
            use super::{Renderer, Result, Source, $opts};
            use std::io::{Read, Seek};
            pub fn detect<R: Read + Seek + ?Sized>(_: &mut R) -> bool { false }
            pub fn boxed(_: Source, _: $opts) -> Result<Box<dyn Renderer>> { panic!("bug") }
        }
    }
}

#[cfg(not(feature = "png"))] dummy_mod!(png, PngOptions);
#[cfg(not(feature = "jpeg"))] dummy_mod!(jpeg, JpegOptions);
