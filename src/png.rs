// Copyright (c) 2014-2015 Tero Hänninen, license: MIT

use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::mem;
use log::{debug, warn};
use super::{
    ImageMetadata, ColType, Format, PngOptions, PixelSink, Renderer, RenderOptions,
    Source, Error, Result, pack_rgb, u32_from_be,
};
use super::cache::{Emitter, PixelCache};

// Streaming PNG decoder: no interlacing, CRCs are skipped unchecked.

/// Header of a PNG image.
///
/// The fields are not parsed into enums or anything like that.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PngHeader {
    pub width              : u32,
    pub height             : u32,
    pub bit_depth          : u8,
    pub color_type         : u8,
    pub compression_method : u8,
    pub filter_method      : u8,
    pub interlace_method   : u8
}

impl PngHeader {
    fn colortype(&self) -> PngColortype {
        // validated when IHDR was read
        PngColortype::from_u8(self.color_type).unwrap_or(PngColortype::Y)
    }

    /// Bytes per complete pixel, at least 1. This is the filters' back-reference.
    pub fn bytes_pp(&self) -> usize {
        let bits = self.colortype().channels() * self.bit_depth as usize;
        ((bits + 7) / 8).max(1)
    }

    /// Bytes in one scanline, not counting the filter type byte. `None` if
    /// that doesn't fit in a `usize`.
    pub fn line_size(&self) -> Option<usize> {
        let bits = (self.width as usize)
            .checked_mul(self.colortype().channels() * self.bit_depth as usize)?;
        Some(bits / 8 + (bits % 8 != 0) as usize)
    }

    pub fn metadata(&self) -> ImageMetadata {
        ImageMetadata {
            width     : self.width,
            height    : self.height,
            bit_depth : self.bit_depth,
            color     : match self.colortype() {
                PngColortype::Y    => ColType::Gray,
                PngColortype::RGB  => ColType::Color,
                PngColortype::Idx  => ColType::Indexed,
                PngColortype::YA   => ColType::GrayAlpha,
                PngColortype::RGBA => ColType::ColorAlpha,
            },
            format    : Format::Png,
        }
    }
}

static PNG_FILE_HEADER: [u8; 8] =
    [0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];

pub fn detect<R: Read + Seek + ?Sized>(reader: &mut R) -> bool {
    let start = match reader.seek(SeekFrom::Current(0))
        { Ok(s) => s, Err(_) => return false };
    let result = read_signature(reader).unwrap_or(false);
    let _ = reader.seek(SeekFrom::Start(start));
    result
}

/// Reads chunks up to and including IHDR.
///
/// Returns `None` if the signature doesn't match.
pub fn read_header<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<Option<PngHeader>> {
    let dc = &mut PngDecoder::new(reader);
    parse_png(dc, None)
}

/// Decodes the whole image, handing each pixel to `out` as it is reconstructed.
fn decode<R: Read + Seek + ?Sized>(reader: &mut R, opts: &PngOptions, out: &mut Emitter)
                                                           -> Result<Option<PngHeader>>
{
    let dc = &mut PngDecoder::new(reader);
    parse_png(dc, Some((opts, out)))
}

struct PngDecoder<'r, R: ?Sized + 'r> {
    stream        : &'r mut R,
    hdr           : Option<PngHeader>,
    palette       : Vec<[u8; 3]>,
    state         : PngState,
    image_done    : bool,
    chunk_lentype : [u8; 8],   // for reading len, type
}

impl<'r, R: Read + Seek + ?Sized> PngDecoder<'r, R> {
    fn new(stream: &'r mut R) -> PngDecoder<'r, R> {
        PngDecoder {
            stream        : stream,
            hdr           : None,
            palette       : Vec::new(),
            state         : PngState::ExpectChunk,
            image_done    : false,
            chunk_lentype : [0u8; 8],
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PngState {
    ExpectChunk,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Chunk {
    Ihdr,
    Plte,
    Idat,
    Iend,
    Other,
}

impl Chunk {
    fn from_tag(tag: &[u8]) -> Chunk {
        match tag {
            b"IHDR" => Chunk::Ihdr,
            b"PLTE" => Chunk::Plte,
            b"IDAT" => Chunk::Idat,
            b"IEND" => Chunk::Iend,
            _ => Chunk::Other,
        }
    }
}

fn read_signature<R: Read + ?Sized>(stream: &mut R) -> Result<bool> {
    let mut buf = [0u8; 8];
    match stream.read_exact(&mut buf) {
        Ok(()) => Ok(buf == PNG_FILE_HEADER),
        Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// With `render` unset this stops as soon as the header is known.
fn parse_png<R: Read + Seek + ?Sized>(dc: &mut PngDecoder<R>,
                                      mut render: Option<(&PngOptions, &mut Emitter)>)
                                                           -> Result<Option<PngHeader>>
{
    if !read_signature(dc.stream)? {
        debug!("png signature mismatch");
        return Ok(None);
    }

    while dc.state != PngState::Done {
        let len = match read_chunkmeta(dc) {
            Ok(len) => len,
            Err(Error::Io(ref e)) if e.kind() == ErrorKind::UnexpectedEof
                                  && dc.image_done => {
                warn!("png stream ends without IEND");
                break;
            }
            Err(e) => return Err(e),
        };
        let chunk = Chunk::from_tag(&dc.chunk_lentype[4..8]);
        debug!("png chunk {} ({} bytes)",
               String::from_utf8_lossy(&dc.chunk_lentype[4..8]), len);

        match chunk {
            Chunk::Ihdr => {
                read_ihdr(dc, len)?;
                if render.is_none() {
                    return Ok(dc.hdr);
                }
            }
            Chunk::Plte => read_plte(dc, len)?,
            Chunk::Idat => {
                let (opts, out) = match render {
                    Some((opts, ref mut out)) => (opts, out),
                    None => return Err(Error::InvalidData("IDAT before IHDR")),
                };
                // also leaves the stream at the last IDAT's CRC
                let compressed = read_idat_chunks(dc, len)?;
                if dc.image_done {
                    warn!("ignoring IDAT chunks after image data");
                } else {
                    decode_image(dc, &compressed, opts, out)?;
                    dc.image_done = true;
                }
            }
            Chunk::Iend => dc.state = PngState::Done,
            Chunk::Other => { dc.stream.seek(SeekFrom::Current(len as i64))?; }
        }

        // CRC, never checked
        dc.stream.seek(SeekFrom::Current(4))?;
    }

    Ok(dc.hdr)
}

fn read_chunkmeta<R: Read + ?Sized>(dc: &mut PngDecoder<R>) -> Result<usize> {
    dc.stream.read_exact(&mut dc.chunk_lentype[0..8])?;
    let len = u32_from_be(&dc.chunk_lentype[0..4]) as usize;
    if 0x7fff_ffff < len { return Err(Error::InvalidData("chunk too long")) }
    Ok(len)
}

const MAX_DIMENSION: u32 = 0x7fff_ffff;

fn read_ihdr<R: Read + Seek + ?Sized>(dc: &mut PngDecoder<R>, len: usize) -> Result<()> {
    if dc.hdr.is_some() || len < 13 {
        warn!("ignoring extra or short IHDR");
        dc.stream.seek(SeekFrom::Current(len as i64))?;
        return Ok(());
    }

    let mut buf = [0u8; 13];
    dc.stream.read_exact(&mut buf)?;
    let hdr = PngHeader {
        width              : u32_from_be(&buf[0..4]),
        height             : u32_from_be(&buf[4..8]),
        bit_depth          : buf[8],
        color_type         : buf[9],
        compression_method : buf[10],
        filter_method      : buf[11],
        interlace_method   : buf[12],
    };
    dc.stream.seek(SeekFrom::Current(len as i64 - 13))?;

    if hdr.width < 1 || MAX_DIMENSION < hdr.width ||
       hdr.height < 1 || MAX_DIMENSION < hdr.height {
        return Err(Error::InvalidData("invalid image dimensions"));
    }
    let ct = match PngColortype::from_u8(hdr.color_type) {
        Some(ct) => ct,
        None => return Err(Error::Unsupported("color type")),
    };
    match (ct, hdr.bit_depth) {
        (PngColortype::Y, 1) | (PngColortype::Y, 2) | (PngColortype::Y, 4) => {}
        (PngColortype::Idx, 1) | (PngColortype::Idx, 2) | (PngColortype::Idx, 4) => {}
        (PngColortype::Idx, 8) => {}
        (PngColortype::Idx, _) => return Err(Error::Unsupported("bit depth")),
        (_, 8) | (_, 16) => {}
        _ => return Err(Error::Unsupported("bit depth")),
    }

    debug!("png {}x{}, depth {}, color type {}",
           hdr.width, hdr.height, hdr.bit_depth, hdr.color_type);
    dc.hdr = Some(hdr);
    Ok(())
}

fn read_plte<R: Read + Seek + ?Sized>(dc: &mut PngDecoder<R>, len: usize) -> Result<()> {
    let entries = len / 3;
    let mut raw = vec![0u8; entries * 3];
    dc.stream.read_exact(&mut raw)?;
    dc.stream.seek(SeekFrom::Current((len % 3) as i64))?;
    dc.palette = raw.chunks(3).map(|c| [c[0], c[1], c[2]]).collect();
    debug!("png palette with {} entries", entries);
    Ok(())
}

// Concatenates consecutive IDAT chunks. The stream is left at the CRC of the
// last one, so the next chunk is read by the main loop as usual.
fn read_idat_chunks<R: Read + Seek + ?Sized>(dc: &mut PngDecoder<R>, mut len: usize)
                                                                  -> Result<Vec<u8>>
{
    let mut all: Vec<u8> = Vec::new();
    loop {
        let start = all.len();
        all.resize(start + len, 0);
        dc.stream.read_exact(&mut all[start..])?;

        // peek past the CRC at the next chunk's length and type
        let pos = dc.stream.seek(SeekFrom::Current(0))?;
        let mut next = [0u8; 12];
        let more = match dc.stream.read_exact(&mut next) {
            Ok(()) => &next[8..12] == b"IDAT",
            Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => false,
            Err(e) => return Err(e.into()),
        };
        if !more {
            dc.stream.seek(SeekFrom::Start(pos))?;
            return Ok(all);
        }
        len = u32_from_be(&next[4..8]) as usize;
        if 0x7fff_ffff < len { return Err(Error::InvalidData("chunk too long")) }
    }
}

fn inflate_idat(data: &[u8]) -> Result<Vec<u8>> {
    ::inflate::inflate_bytes_zlib(data).map_err(Error::Inflate)
}

fn decode_image<R: ?Sized>(dc: &PngDecoder<R>, compressed: &[u8], opts: &PngOptions,
                                                            out: &mut Emitter)
                                                                   -> Result<()>
{
    let hdr = match dc.hdr {
        Some(h) => h,
        None => return Err(Error::InvalidData("IDAT before IHDR")),
    };
    if hdr.interlace_method != 0 {
        return Err(Error::Unsupported("interlaced png"));
    }

    let data = inflate_idat(compressed)?;

    let w = hdr.width as usize;
    let h = hdr.height as usize;
    let fstep = hdr.bytes_pp();
    let linesize = hdr.line_size().ok_or(Error::InvalidData("image too large"))?;
    let needed = (linesize + 1).checked_mul(h)
        .ok_or(Error::InvalidData("image too large"))?;
    if data.len() < needed {
        return Err(Error::InvalidData("not enough image data"));
    }

    let ct = hdr.colortype();
    let mut cline = vec![0u8; linesize];
    let mut pline = vec![0u8; linesize];   // zeros stand in for the row above the first
    let mut bad_indices = 0;

    for j in 0 .. h {
        let si = j * (linesize + 1);
        let filter = match PngFilter::from_u8(data[si]) {
            Some(f) => f,
            None => return Err(Error::InvalidData("invalid filter type")),
        };
        cline.copy_from_slice(&data[si+1 .. si+1+linesize]);
        recon(&mut cline, &pline, filter, fstep);

        for i in 0 .. w {
            let rgb = match ct {
                PngColortype::Idx => {
                    let idx = sample(&cline, i, hdr.bit_depth) as usize;
                    match dc.palette.get(idx) {
                        Some(p) => Some(pack_rgb(p[0], p[1], p[2])),
                        None => { bad_indices += 1; Some(0) }
                    }
                }
                _ => pixel_color(&cline, i, ct, hdr.bit_depth, opts),
            };
            out.pixel(i, j, rgb);
        }
        out.end_run(w, 1);

        mem::swap(&mut pline, &mut cline);
    }

    if 0 < bad_indices {
        warn!("{} pixels index past the palette ({} entries)", bad_indices, dc.palette.len());
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PngColortype {
    Y    = 0,
    RGB  = 2,
    Idx  = 3,
    YA   = 4,
    RGBA = 6,
}

impl PngColortype {
    fn from_u8(val: u8) -> Option<PngColortype> {
        match val {
            0 => Some(PngColortype::Y),
            2 => Some(PngColortype::RGB),
            3 => Some(PngColortype::Idx),
            4 => Some(PngColortype::YA),
            6 => Some(PngColortype::RGBA),
            _ => None,
        }
    }

    fn channels(self) -> usize {
        match self {
            PngColortype::Y | PngColortype::Idx => 1,
            PngColortype::YA                    => 2,
            PngColortype::RGB                   => 3,
            PngColortype::RGBA                  => 4,
        }
    }
}

/// Returns sample `si` of a reconstructed scanline.
///
/// Sub-byte samples are packed most significant bits first. 16-bit samples
/// are truncated to their high byte.
fn sample(line: &[u8], si: usize, depth: u8) -> u8 {
    match depth {
        8  => line[si],
        16 => line[si * 2],
        _  => {
            let d = depth as usize;
            let bit = si * d;
            let shift = 8 - d - bit % 8;
            (line[bit / 8] >> shift) & ((1u8 << d) - 1)
        }
    }
}

// Palette lookups are done by the caller.
fn pixel_color(line: &[u8], x: usize, ct: PngColortype, depth: u8, opts: &PngOptions)
                                                                      -> Option<u32>
{
    let base = x * ct.channels();
    let s = |c: usize| sample(line, base + c, depth);
    match ct {
        PngColortype::Y => {
            let g = if depth < 8 {
                (s(0) as u32 * 255 / ((1 << depth) - 1)) as u8
            } else {
                s(0)
            };
            Some(pack_rgb(g, g, g))
        }
        PngColortype::RGB  => Some(pack_rgb(s(0), s(1), s(2))),
        PngColortype::YA   => composite(s(0), s(0), s(0), s(1), opts),
        PngColortype::RGBA => composite(s(0), s(1), s(2), s(3), opts),
        PngColortype::Idx  => None,
    }
}

/// Zero alpha skips the pixel. Fast mode treats any other alpha as opaque;
/// otherwise the color is blended over the background.
fn composite(r: u8, g: u8, b: u8, a: u8, opts: &PngOptions) -> Option<u32> {
    if a == 0 { return None }
    if opts.fast_alpha || a == 255 {
        return Some(pack_rgb(r, g, b));
    }
    let a = a as u32;
    let mix = |c: u8, bg: u8| ((c as u32 * a + bg as u32 * (255 - a) + 127) / 255) as u8;
    Some(pack_rgb(mix(r, opts.bg[0]), mix(g, opts.bg[1]), mix(b, opts.bg[2])))
}

fn recon(cline: &mut[u8], pline: &[u8], filter: PngFilter, fstep: usize) {
    match filter {
        PngFilter::None => { }
        PngFilter::Sub => {
            for k in fstep .. cline.len() {
                cline[k] = cline[k].wrapping_add(cline[k-fstep]);
            }
        }
        PngFilter::Up => {
            for (c, &p) in cline.iter_mut().zip(pline) {
                *c = c.wrapping_add(p);
            }
        }
        PngFilter::Average => {
            for (c, &p) in cline.iter_mut().zip(pline).take(fstep) {
                *c = c.wrapping_add(p / 2);
            }
            for k in fstep .. cline.len() {
                let avg = (cline[k-fstep] as u32 + pline[k] as u32) / 2;
                cline[k] = cline[k].wrapping_add(avg as u8);
            }
        }
        PngFilter::Paeth => {
            for (c, &p) in cline.iter_mut().zip(pline).take(fstep) {
                *c = c.wrapping_add(paeth(0, p, 0));
            }
            for k in fstep .. cline.len() {
                let pred = paeth(cline[k-fstep], pline[k], pline[k-fstep]);
                cline[k] = cline[k].wrapping_add(pred);
            }
        }
    }
}

// Whichever of a, b, c is closest to a + b - c, ties going to a, then b.
fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let mut pc = c as i32;
    let mut pa = b as i32 - pc;
    let mut pb = a as i32 - pc;
    pc = pa + pb;
    if pa < 0 { pa = -pa; }
    if pb < 0 { pb = -pb; }
    if pc < 0 { pc = -pc; }

    if pa <= pb && pa <= pc {
        return a;
    } else if pb <= pc {
        return b;
    }
    c
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PngFilter {
    None = 0,
    Sub,
    Up,
    Average,
    Paeth,
}

impl PngFilter {
    fn from_u8(val: u8) -> Option<PngFilter> {
        match val {
            0 => Some(PngFilter::None),
            1 => Some(PngFilter::Sub),
            2 => Some(PngFilter::Up),
            3 => Some(PngFilter::Average),
            4 => Some(PngFilter::Paeth),
            _ => None,
        }
    }
}

// --------------------------------------------------
// Renderer

/// Decodes a PNG source straight into a `PixelSink`.
pub struct PngRenderer {
    source   : Source,
    opts     : PngOptions,
    hdr      : Option<PngHeader>,
    cache    : PixelCache,
    rendered : bool,
}

impl PngRenderer {
    pub fn new<S: Into<Source>>(source: S, opts: PngOptions) -> PngRenderer {
        PngRenderer {
            source   : source.into(),
            opts     : opts,
            hdr      : None,
            cache    : PixelCache::new(),
            rendered : false,
        }
    }

    /// Like `metadata` but returns the raw header.
    pub fn header(&mut self) -> Result<Option<PngHeader>> {
        if self.hdr.is_none() {
            let reader = &mut self.source.open()?;
            self.hdr = read_header(reader)?;
        }
        Ok(self.hdr)
    }
}

impl Renderer for PngRenderer {
    fn metadata(&mut self) -> Result<Option<ImageMetadata>> {
        Ok(self.header()?.map(|h| h.metadata()))
    }

    fn render(&mut self, opts: &RenderOptions, sink: &mut dyn PixelSink) -> Result<()> {
        if self.rendered {
            if !self.opts.cache {
                return Err(Error::AlreadyRendered);
            }
            if let Some(hdr) = self.hdr {
                self.cache.replay(opts.x, opts.y, hdr.width, sink);
            }
            return Ok(());
        }

        if let Some(color) = opts.placeholder {
            if let Some(hdr) = self.header()? {
                sink.placeholder(opts.x, opts.y, hdr.width, hdr.height, color);
            }
        }

        self.cache.clear();
        let cache = if self.opts.cache { Some(&mut self.cache) } else { None };
        let out = &mut Emitter::new(opts.x, opts.y, sink, cache);
        let reader = &mut self.source.open()?;
        let hdr = decode(reader, &self.opts, out)?;
        if self.hdr.is_none() {
            self.hdr = hdr;
        }
        self.rendered = true;
        Ok(())
    }
}

pub fn boxed(source: Source, opts: PngOptions) -> Result<Box<dyn Renderer>> {
    Ok(Box::new(PngRenderer::new(source, opts)))
}
