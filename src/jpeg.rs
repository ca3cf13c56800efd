// Copyright (c) 2014-2015 Tero Hänninen, license: MIT

use std::f32::consts::{FRAC_1_SQRT_2, PI};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use log::{debug, trace, warn};
use super::{
    ImageMetadata, ColType, Format, JpegOptions, PixelSink, Renderer, RenderOptions,
    Source, Error, Result, IFRead, pack_rgb, u16_from_be,
};
use super::cache::{Emitter, PixelCache};

// Baseline JPEG decoder

/// Frame header fields, read without touching the entropy-coded data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JpegHeader {
    pub width     : u16,
    pub height    : u16,
    pub precision : u8,
    pub num_comps : u8,
    /// Which SOFn marker declared the frame.
    pub sof       : u8,
}

impl JpegHeader {
    pub fn metadata(&self) -> ImageMetadata {
        ImageMetadata {
            width     : self.width as u32,
            height    : self.height as u32,
            bit_depth : self.precision,
            color     : if self.num_comps == 1 { ColType::Gray } else { ColType::Color },
            format    : Format::Jpeg,
        }
    }
}

pub fn detect<R: Read + Seek + ?Sized>(reader: &mut R) -> bool {
    let start = match reader.seek(SeekFrom::Current(0))
        { Ok(s) => s, Err(_) => return false };
    let mut soi = [0u8; 2];
    let result = reader.read_exact(&mut soi).is_ok() && soi == [0xff, SOI];
    let _ = reader.seek(SeekFrom::Start(start));
    result
}

/// Reads markers up to the frame header.
///
/// Returns `None` if this isn't a JPEG or it has no frame header.
pub fn read_header<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<Option<JpegHeader>> {
    let dc = &mut JpegDecoder::new(reader, 8);
    read_markers(dc, None)
}

fn decode<R: Read + Seek + ?Sized>(reader: &mut R, quality: u8, out: &mut Emitter)
                                                          -> Result<Option<JpegHeader>>
{
    let dc = &mut JpegDecoder::new(reader, quality as usize);
    read_markers(dc, Some(out))
}

struct JpegDecoder<'r, R: ?Sized + 'r> {
    stream      : &'r mut R,
    state       : JpegState,
    hdr         : Option<JpegHeader>,
    w           : usize,
    h           : usize,    // 0 until DNL if the frame header left it open

    qtables     : [[u16; 64]; 4],
    ac_tables   : [HuffTab; 4],
    dc_tables   : [HuffTab; 4],

    comps       : Vec<Component>,
    scan_comps  : Vec<usize>,   // indices into comps, in scan order
    hmax        : usize,
    vmax        : usize,
    restart_interval : usize,

    idct        : Idct,
}

impl<'r, R: Read + Seek + ?Sized> JpegDecoder<'r, R> {
    fn new(stream: &'r mut R, precision: usize) -> JpegDecoder<'r, R> {
        JpegDecoder {
            stream      : stream,
            state       : JpegState::ScanningMarkers,
            hdr         : None,
            w           : 0,
            h           : 0,
            qtables     : [[0; 64]; 4],
            ac_tables   : [HuffTab::new(), HuffTab::new(), HuffTab::new(), HuffTab::new()],
            dc_tables   : [HuffTab::new(), HuffTab::new(), HuffTab::new(), HuffTab::new()],
            comps       : Vec::new(),
            scan_comps  : Vec::new(),
            hmax        : 1,
            vmax        : 1,
            restart_interval : 0,
            idct        : Idct::new(precision),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum JpegState {
    ScanningMarkers,
    InEntropyScan,
    Done,
}

struct Component {
    id       : u8,
    sfx      : usize,            // sampling factor, aka. h
    sfy      : usize,            // sampling factor, aka. v
    qtable   : usize,
    ac_table : usize,
    dc_table : usize,
    pred     : i32,          // dc prediction
}

const SOF0: u8 = 0xc0;    // start of frame / baseline DCT
const SOF1: u8 = 0xc1;    // start of frame / extended seq.
const SOF15: u8 = 0xcf;   // last of the SOFn range
const DHT: u8 = 0xc4;     // define huffman tables
const JPG: u8 = 0xc8;     // reserved
const DAC: u8 = 0xcc;     // define arithmetic conditioning table
const DQT: u8 = 0xdb;     // define quantization tables
const DNL: u8 = 0xdc;     // define number of lines
const DRI: u8 = 0xdd;     // define restart interval
const SOS: u8 = 0xda;     // start of scan
const RST0: u8 = 0xd0;    // restart entropy coded data
// ...
const RST7: u8 = 0xd7;    // restart entropy coded data
const SOI: u8 = 0xd8;     // start of image
const EOI: u8 = 0xd9;     // end of image
const APP0: u8 = 0xe0;    // application 0 segment (jfif)
// ...
const APPF: u8 = 0xef;    // application f segment
const COM: u8 = 0xfe;     // comment
const TEM: u8 = 0x01;     // temporary, no length

// Marker state machine. With `out` unset it returns at the frame header.
fn read_markers<R: Read + Seek + ?Sized>(dc: &mut JpegDecoder<R>,
                                         mut out: Option<&mut Emitter>)
                                                   -> Result<Option<JpegHeader>>
{
    let mut marker = [0u8; 2];
    // SOI
    match dc.stream.read_exact(&mut marker) {
        Ok(()) if marker == [0xff, SOI] => {}
        Ok(()) => return Ok(None),
        Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    while dc.state != JpegState::Done {
        let code = match next_marker(dc.stream)? {
            Some(c) => c,
            None => {
                debug!("jpeg stream ends without EOI");
                break;
            }
        };
        debug!("marker: 0x{:x}", code);

        match code {
            DHT => read_huffman_tables(dc)?,
            DQT => read_quantization_tables(dc)?,
            DRI => read_restart_interval(dc)?,
            DNL => read_dnl(dc)?,
            JPG | DAC => skip_segment(dc.stream)?,
            SOF0 ..= SOF15 => {
                read_frame_header(dc, code)?;
                if out.is_none() {
                    return Ok(dc.hdr);
                }
            }
            SOS => {
                if dc.hdr.is_none() {
                    return Err(Error::InvalidData("no frame header"))
                }
                read_scan_header(dc)?;
                let out = match out {
                    Some(ref mut out) => out,
                    None => return Ok(None),
                };
                dc.state = JpegState::InEntropyScan;
                let end = decode_scan(dc, out)?;
                if end == Some(DNL) {
                    read_dnl(dc)?;
                }
                // progressive images aren't supported so only one scan
                dc.state = JpegState::Done;
            }
            EOI => dc.state = JpegState::Done,
            RST0 ..= RST7 | TEM => {}
            APP0 ..= APPF | COM => skip_segment(dc.stream)?,
            _ => {
                debug!("skipping unknown marker 0x{:x}", code);
                skip_segment(dc.stream)?;
            }
        }
    }
    Ok(dc.hdr)
}

// Finds the next marker code, skipping stray bytes and fill. `None` at end of input.
fn next_marker<R: Read + ?Sized>(stream: &mut R) -> Result<Option<u8>> {
    let mut b = match read_or_eof(stream)? { Some(b) => b, None => return Ok(None) };
    while b != 0xff {
        b = match read_or_eof(stream)? { Some(b) => b, None => return Ok(None) };
    }
    while b == 0xff {
        b = match read_or_eof(stream)? { Some(b) => b, None => return Ok(None) };
    }
    Ok(Some(b))
}

fn read_or_eof<R: Read + ?Sized>(stream: &mut R) -> Result<Option<u8>> {
    match stream.read_u8() {
        Ok(b) => Ok(Some(b)),
        Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_length<R: Read + ?Sized>(stream: &mut R) -> Result<usize> {
    let mut tmp = [0u8; 2];
    stream.read_exact(&mut tmp)?;
    let len = u16_from_be(&tmp) as usize;
    if len < 2 { return Err(Error::InvalidData("invalid data length")) }
    Ok(len - 2)
}

fn skip_segment<R: Read + Seek + ?Sized>(stream: &mut R) -> Result<()> {
    let len = read_length(stream)?;
    stream.seek(SeekFrom::Current(len as i64))?;
    Ok(())
}

struct HuffTab {
    values  : [u8; 256],
    mincode : [i32; 16],
    maxcode : [i32; 16],
    valptr  : [i32; 16],
}

impl HuffTab {
    fn new() -> HuffTab {
        HuffTab {
            values  : [0; 256],
            mincode : [-1; 16],
            maxcode : [-1; 16],
            valptr  : [-1; 16],
        }
    }

    /// Symbol for the `len`-bit code `code`, if the table has one.
    #[inline]
    fn lookup(&self, len: usize, code: i32) -> Option<u8> {
        let i = len - 1;
        if self.maxcode[i] < code || code < self.mincode[i] {
            return None;
        }
        self.values.get((self.valptr[i] + code - self.mincode[i]) as usize).cloned()
    }
}

/// Assigns canonical codes from the 16 per-length symbol counts.
///
/// Returns `(length, code)` pairs in symbol order.
pub fn huffman_codes(counts: &[u8; 16]) -> Vec<(u8, u16)> {
    let mut codes = Vec::new();
    let mut code = 0u32;
    for (i, &n) in counts.iter().enumerate() {
        for _ in 0 .. n {
            codes.push(((i + 1) as u8, code as u16));
            code += 1;
        }
        code <<= 1;
    }
    codes
}

fn read_huffman_tables<R: Read + ?Sized>(dc: &mut JpegDecoder<R>) -> Result<()> {
    let mut buf = [0u8; 17];
    let mut len = read_length(dc.stream)? as isize;

    while 0 < len {
        dc.stream.read_exact(&mut buf[0..17])?;  // info byte and BITS
        let table_class = buf[0] >> 4;            // 0 = dc table, 1 = ac table
        let table_slot = (buf[0] & 0xf) as usize;
        if 3 < table_slot || 1 < table_class {
            return Err(Error::InvalidData("invalid table slot or class"))
        }

        let mut counts = [0u8; 16];
        counts.copy_from_slice(&buf[1..17]);
        let mt: usize = counts.iter().map(|&n| n as usize).sum();
        if 256 < mt {
            return Err(Error::InvalidData("too many huffman codes"));
        }

        let table = if table_class == 0 {
            &mut dc.dc_tables[table_slot]
        } else {
            &mut dc.ac_tables[table_slot]
        };
        dc.stream.read_exact(&mut table.values[0..mt])?;
        derive_table(table, &counts);
        debug!("{} huffman table {}: {} codes",
               if table_class == 0 { "dc" } else { "ac" }, table_slot, mt);

        len -= 17 + mt as isize;
    }
    Ok(())
}

fn derive_table(table: &mut HuffTab, counts: &[u8; 16]) {
    let codes = huffman_codes(counts);

    table.mincode = [-1; 16];
    table.maxcode = [-1; 16];
    table.valptr = [-1; 16];

    let mut j = 0;
    for i in 0 .. 16 {
        if counts[i] != 0 {
            table.valptr[i] = j as i32;
            table.mincode[i] = codes[j].1 as i32;
            j += (counts[i] - 1) as usize;
            table.maxcode[i] = codes[j].1 as i32;
            j += 1;
        }
    }
}

fn read_quantization_tables<R: Read + ?Sized>(dc: &mut JpegDecoder<R>) -> Result<()> {
    let mut len = read_length(dc.stream)? as isize;

    while 0 < len {
        let info = dc.stream.read_u8()?;
        let precision = info >> 4;  // 0 = 8 bit, 1 = 16 bit
        let table_slot = (info & 0xf) as usize;
        if 3 < table_slot {
            return Err(Error::InvalidData("table slot"))
        }
        let table = &mut dc.qtables[table_slot];
        if precision == 0 {
            let mut raw = [0u8; 64];
            dc.stream.read_exact(&mut raw)?;
            for (q, &b) in table.iter_mut().zip(&raw[..]) {
                *q = b as u16;
            }
            len -= 65;
        } else {
            let mut raw = [0u8; 128];
            dc.stream.read_exact(&mut raw)?;
            for (q, b) in table.iter_mut().zip(raw.chunks(2)) {
                *q = u16_from_be(b);
            }
            len -= 129;
        }
        debug!("quantization table {}, {} bit", table_slot, if precision == 0 { 8 } else { 16 });
    }
    Ok(())
}

fn read_frame_header<R: Read + ?Sized>(dc: &mut JpegDecoder<R>, sof: u8) -> Result<()> {
    if dc.hdr.is_some() {
        return Err(Error::InvalidData("extra frame header"))
    }
    let len = read_length(dc.stream)?;
    let mut buf = vec![0u8; len];
    dc.stream.read_exact(&mut buf)?;
    if len < 6 {
        return Err(Error::InvalidData("frame header"));
    }
    let precision = buf[0];
    let h = u16_from_be(&buf[1..3]);
    let w = u16_from_be(&buf[3..5]);
    let num_comps = buf[5] as usize;

    if num_comps < 1 || 4 < num_comps || len < 6 + num_comps*3 {
        return Err(Error::InvalidData("frame header"));
    }
    if sof != SOF0 && sof != SOF1 {
        warn!("SOF{} frame is not baseline, output is unspecified", sof - SOF0);
    }

    dc.comps.clear();
    dc.hmax = 0;
    dc.vmax = 0;
    for i in 0 .. num_comps {
        let c = &buf[6 + i*3 .. 9 + i*3];
        let comp = Component {
            id       : c[0],
            sfx      : (c[1] >> 4) as usize,
            sfy      : (c[1] & 0xf) as usize,
            qtable   : c[2] as usize,
            ac_table : 0,
            dc_table : 0,
            pred     : 0,
        };
        if comp.sfy < 1 || 4 < comp.sfy ||
           comp.sfx < 1 || 4 < comp.sfx ||
           3 < comp.qtable {
            return Err(Error::InvalidData("component meta data"))
        }
        if dc.hmax < comp.sfx { dc.hmax = comp.sfx; }
        if dc.vmax < comp.sfy { dc.vmax = comp.sfy; }
        dc.comps.push(comp);
    }

    dc.w = w as usize;
    dc.h = h as usize;
    dc.hdr = Some(JpegHeader {
        width     : w,
        height    : h,
        precision : precision,
        num_comps : num_comps as u8,
        sof       : sof,
    });
    debug!("frame {}x{}, {} components, max sampling {}x{}",
           w, h, num_comps, dc.hmax, dc.vmax);
    Ok(())
}

fn read_scan_header<R: Read + ?Sized>(dc: &mut JpegDecoder<R>) -> Result<()> {
    let len = read_length(dc.stream)?;
    let mut buf = vec![0u8; len];
    dc.stream.read_exact(&mut buf)?;
    let num_scan_comps = if len > 0 { buf[0] as usize } else { 0 };

    if num_scan_comps < 1 || len < 4 + num_scan_comps*2 {
        return Err(Error::InvalidData("scan header"))
    }

    dc.scan_comps.clear();
    for i in 0 .. num_scan_comps {
        let id = buf[1 + i*2];
        let ci = match dc.comps.iter().position(|c| c.id == id) {
            Some(ci) => ci,
            None => return Err(Error::InvalidData("component id")),
        };

        let tables = buf[2 + i*2];
        let comp = &mut dc.comps[ci];
        comp.dc_table = (tables >> 4) as usize;
        comp.ac_table = (tables & 0xf) as usize;
        if 3 < comp.dc_table || 3 < comp.ac_table {
            return Err(Error::InvalidData("dc/ac table index"));
        }
        dc.scan_comps.push(ci);
    }

    // ignore last 3 bytes: spectral_start, spectral_end, approx
    Ok(())
}

fn read_restart_interval<R: Read + ?Sized>(dc: &mut JpegDecoder<R>) -> Result<()> {
    let mut buf = [0u8; 4];
    dc.stream.read_exact(&mut buf)?;
    let len = u16_from_be(&buf[0..2]) as usize;
    if len != 4 { return Err(Error::InvalidData("restart interval")) }
    dc.restart_interval = u16_from_be(&buf[2..4]) as usize;
    debug!("restart interval {}", dc.restart_interval);
    Ok(())
}

fn read_dnl<R: Read + ?Sized>(dc: &mut JpegDecoder<R>) -> Result<()> {
    let mut buf = [0u8; 4];
    dc.stream.read_exact(&mut buf)?;
    let lines = u16_from_be(&buf[2..4]);
    if dc.h == 0 {
        debug!("height {} from DNL", lines);
        dc.h = lines as usize;
        if let Some(ref mut hdr) = dc.hdr {
            hdr.height = lines;
        }
    }
    Ok(())
}

// ------------------------------------------------------------
// Entropy-coded data

/// Pulls bits out of entropy-coded data, most significant first.
///
/// Stuffed `0xff 0x00` pairs come out as `0xff`. Any marker other than RSTn
/// ends the data (remembered in `marker`), as does the end of input or a read
/// failure (kept in `error`); from then on every pull yields `None`.
struct Bits<'r, R: ?Sized + 'r> {
    stream    : &'r mut R,
    cb        : u8,   // current byte
    bits_left : u8,   // num of unused bits in cb
    ended     : bool,
    marker    : Option<u8>,
    error     : Option<io::Error>,
}

impl<'r, R: Read + Seek + ?Sized> Bits<'r, R> {
    fn new(stream: &'r mut R) -> Bits<'r, R> {
        Bits { stream: stream, cb: 0, bits_left: 0, ended: false, marker: None, error: None }
    }

    fn fetch(&mut self) -> Option<u8> {
        if self.ended { return None }
        loop {
            let b = self.read_raw()?;
            if b != 0xff { return Some(b) }
            let mut m = self.read_raw()?;
            while m == 0xff {
                m = self.read_raw()?;
            }
            match m {
                0x00 => return Some(0xff),
                RST0 ..= RST7 => trace!("stray RST{}", m - RST0),
                _ => {
                    debug!("entropy data ends at marker 0x{:x}", m);
                    self.marker = Some(m);
                    self.ended = true;
                    return None;
                }
            }
        }
    }

    fn read_raw(&mut self) -> Option<u8> {
        match self.stream.read_u8() {
            Ok(b) => Some(b),
            Err(e) => {
                self.end_with(e);
                None
            }
        }
    }

    fn end_with(&mut self, e: io::Error) {
        if e.kind() == ErrorKind::UnexpectedEof {
            warn!("entropy data truncated");
        } else {
            self.error = Some(e);
        }
        self.ended = true;
    }

    /// True once no more bits can be pulled. May prefetch one byte.
    fn exhausted(&mut self) -> bool {
        if self.bits_left == 0 {
            match self.fetch() {
                Some(b) => { self.cb = b; self.bits_left = 8; }
                None => return true,
            }
        }
        false
    }

    /// Drops the partial byte and consumes the RSTn ending a restart interval.
    fn restart(&mut self) {
        self.cb = 0;
        self.bits_left = 0;
        if self.ended { return }

        let mut buf = [0u8; 2];
        if let Err(e) = self.stream.read_exact(&mut buf) {
            self.end_with(e);
            return;
        }
        if buf[0] == 0xff && RST0 <= buf[1] && buf[1] <= RST7 {
            return;
        }
        warn!("restart marker missing");
        if let Err(e) = self.stream.seek(SeekFrom::Current(-2)) {
            self.end_with(e);
        }
    }
}

impl<'r, R: Read + Seek + ?Sized> Iterator for Bits<'r, R> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.bits_left == 0 {
            self.cb = self.fetch()?;
            self.bits_left = 8;
        }
        let r = self.cb >> 7;
        self.cb <<= 1;
        self.bits_left -= 1;
        Some(r)
    }
}

fn decode_huff<I: Iterator<Item = u8>>(bits: &mut I, tab: &HuffTab) -> Option<u8> {
    let mut code = 0i32;
    for len in 1 ..= 16 {
        code = (code << 1) | bits.next()? as i32;
        if let Some(v) = tab.lookup(len, code) {
            return Some(v);
        }
    }
    None
}

fn receive<I: Iterator<Item = u8>>(bits: &mut I, s: u8) -> Option<i32> {
    let mut v = 0;
    for _ in 0 .. s {
        v = (v << 1) | bits.next()? as i32;
    }
    Some(v)
}

/// Sign-extends the `s` additional bits in `v` (section F.2.2.1).
#[inline]
pub fn extend(v: i32, s: u8) -> i32 {
    if v & (1 << (s - 1)) == 0 {
        v - ((1 << s) - 1)
    } else {
        v
    }
}

const MAX_DC_CATEGORY: u8 = 11;
const MAX_AC_CATEGORY: u8 = 10;

// Decodes one data unit into `zz` (zigzag order) and returns how many
// coefficients were decoded. On a short or corrupt stream it stops early and
// the rest stay zero.
fn decode_block<I: Iterator<Item = u8>>(bits: &mut I, dctab: &HuffTab, actab: &HuffTab,
                                        pred: &mut i32, zz: &mut [i32; 64]) -> usize
{
    *zz = [0; 64];

    let t = match decode_huff(bits, dctab) { Some(t) => t, None => return 0 };
    if MAX_DC_CATEGORY < t {
        return 0;   // corrupt table
    }
    let diff = if 0 < t {
        match receive(bits, t) { Some(v) => extend(v, t), None => return 0 }
    } else {
        0
    };
    *pred = pred.wrapping_add(diff);
    zz[0] = *pred;

    let mut k = 1;
    while k < 64 {
        let rs = match decode_huff(bits, actab) { Some(rs) => rs, None => break };
        let rrrr = (rs >> 4) as usize;
        let ssss = rs & 0xf;

        if ssss == 0 {
            if rrrr != 0xf {
                return 64;  // end of block
            }
            k += 16;    // run length is 16
            continue;
        }
        k += rrrr;

        if 63 < k || MAX_AC_CATEGORY < ssss {
            break;
        }
        match receive(bits, ssss) {
            Some(v) => zz[k] = extend(v, ssss),
            None => break,
        }
        k += 1;
    }
    k.min(64)
}

static DEZIGZAG: [u8; 64] = [
     0,  1,  8, 16,  9,  2,  3, 10,
    17, 24, 32, 25, 18, 11,  4,  5,
    12, 19, 26, 33, 40, 48, 41, 34,
    27, 20, 13,  6,  7, 14, 21, 28,
    35, 42, 49, 56, 57, 50, 43, 36,
    29, 22, 15, 23, 30, 37, 44, 51,
    58, 59, 52, 45, 38, 31, 39, 46,
    53, 60, 61, 54, 47, 55, 62, 63,
];

// The quant table is stored in zigzag order too.
#[inline]
fn dequantize(zz: &mut [i32; 64], qtable: &[u16; 64]) {
    for (c, &q) in zz.iter_mut().zip(qtable.iter()) {
        *c = c.wrapping_mul(q as i32);
    }
}

/// Zigzag to natural order. Positions past `count` are zero.
fn descan(zz: &[i32; 64], count: usize, block: &mut [i32; 64]) {
    for k in 0 .. 64 {
        block[DEZIGZAG[k] as usize] = if k < count { zz[k] } else { 0 };
    }
}

/// Separable IDCT summing only the lowest `precision` frequencies per axis.
struct Idct {
    table     : [[f32; 8]; 8],   // [u][x] = C(u) cos((2x+1)uπ/16)
    precision : usize,
}

impl Idct {
    fn new(precision: usize) -> Idct {
        let mut table = [[0f32; 8]; 8];
        for (u, row) in table.iter_mut().enumerate() {
            let cu = if u == 0 { FRAC_1_SQRT_2 } else { 1.0 };
            for (x, t) in row.iter_mut().enumerate() {
                *t = cu * (((2 * x + 1) * u) as f32 * PI / 16.0).cos();
            }
        }
        Idct { table: table, precision: precision.max(1).min(8) }
    }

    // Output samples are still level shifted, centered on 0.
    fn transform(&self, block: &[i32; 64], out: &mut [i16; 64]) {
        let p = self.precision;
        let t = &self.table;

        // rows: tmp[v][x] = sum over u of F(v, u) * T(u, x)
        let mut tmp = [[0f32; 8]; 8];
        for v in 0 .. p {
            for x in 0 .. 8 {
                let mut s = 0.0;
                for u in 0 .. p {
                    s += block[v*8 + u] as f32 * t[u][x];
                }
                tmp[v][x] = s;
            }
        }

        for y in 0 .. 8 {
            for x in 0 .. 8 {
                let mut s = 0.0;
                for v in 0 .. p {
                    s += tmp[v][x] * t[v][y];
                }
                out[y*8 + x] = (s / 4.0).round() as i16;
            }
        }
    }
}

// Decodes MCUs and emits their pixels until the image is complete or the
// entropy data ends. Returns the marker that ended the data, if any.
fn decode_scan<R: Read + Seek + ?Sized>(dc: &mut JpegDecoder<R>, out: &mut Emitter)
                                                             -> Result<Option<u8>>
{
    // a non-interleaved scan has one data unit per MCU
    let single = dc.scan_comps.len() == 1;
    let (hmax, vmax) = if single { (1, 1) } else { (dc.hmax, dc.vmax) };
    let sampling: Vec<(usize, usize)> = dc.scan_comps.iter().map(|&ci| {
        if single { (1, 1) } else { (dc.comps[ci].sfx, dc.comps[ci].sfy) }
    }).collect();

    let mcu_w = 8 * hmax;
    let mcu_h = 8 * vmax;
    let num_mcu_x = (dc.w + mcu_w-1) / mcu_w;
    if num_mcu_x == 0 {
        return Ok(None);
    }
    let total = if dc.h == 0 {
        usize::MAX   // until the data ends
    } else {
        num_mcu_x * ((dc.h + mcu_h-1) / mcu_h)
    };

    let mut units: Vec<Vec<[i16; 64]>> =
        sampling.iter().map(|&(h, v)| vec![[0i16; 64]; h * v]).collect();

    let JpegDecoder {
        ref mut stream, ref qtables, ref dc_tables, ref ac_tables,
        ref mut comps, ref scan_comps, ref idct, restart_interval, w, h, ..
    } = *dc;
    let mut bits = Bits::new(&mut **stream);

    for c in comps.iter_mut() {
        c.pred = 0;
    }

    let mut zz = [0i32; 64];
    let mut block = [0i32; 64];
    let mut m = 0;
    while m < total {
        if 0 < m && 0 < restart_interval && m % restart_interval == 0 {
            bits.restart();
            for c in comps.iter_mut() {
                c.pred = 0;
            }
        }
        if bits.exhausted() {
            if h != 0 {
                warn!("entropy data ended after {} of {} MCUs", m, total);
            }
            break;
        }

        let mcu_x = m % num_mcu_x;
        let mcu_y = m / num_mcu_x;
        if mcu_x == 0 {
            trace!("mcu row {}", mcu_y);
        }

        for (si, &ci) in scan_comps.iter().enumerate() {
            let comp = &mut comps[ci];
            for unit in units[si].iter_mut() {
                let n = decode_block(&mut bits, &dc_tables[comp.dc_table],
                                     &ac_tables[comp.ac_table], &mut comp.pred, &mut zz);
                dequantize(&mut zz, &qtables[comp.qtable]);
                descan(&zz, n, &mut block);
                idct.transform(&block, unit);
            }
        }
        // without a height, an MCU cut short by the end of data is not part of the image
        if h == 0 && bits.ended {
            break;
        }

        // clip partial MCUs at the right and bottom edges
        let x0 = mcu_x * mcu_w;
        let y0 = mcu_y * mcu_h;
        let bw = mcu_w.min(w - x0);
        let bh = if h == 0 { mcu_h } else { mcu_h.min(h - y0) };
        for py in 0 .. bh {
            for px in 0 .. bw {
                let rgb = mcu_pixel(&units, &sampling, hmax, vmax, px, py);
                out.pixel(x0 + px, y0 + py, Some(rgb));
            }
        }
        out.end_run(bw, bh);

        m += 1;
    }

    match bits.error {
        Some(e) => Err(e.into()),
        None => Ok(bits.marker),
    }
}

// Nearest neighbor: output coordinates are divided by each component's
// subsampling ratio.
fn mcu_pixel(units: &[Vec<[i16; 64]>], sampling: &[(usize, usize)], hmax: usize,
                                           vmax: usize, px: usize, py: usize) -> u32
{
    let sample = |c: usize| -> i32 {
        let (h, v) = sampling[c];
        let sx = (px / (hmax / h)).min(8*h - 1);
        let sy = (py / (vmax / v)).min(8*v - 1);
        units[c][(sy / 8) * h + sx / 8][(sy % 8) * 8 + sx % 8] as i32
    };

    if units.len() < 3 {
        let g = clamp_to_u8(sample(0) as f32 + 128.0);
        return pack_rgb(g, g, g);
    }
    ycbcr_to_rgb(sample(0), sample(1), sample(2))
}

// Takes level-shifted samples. BT.601 luma weights.
fn ycbcr_to_rgb(y: i32, cb: i32, cr: i32) -> u32 {
    const KR: f32 = 0.299;
    const KG: f32 = 0.587;
    const KB: f32 = 0.114;
    let (y, cb, cr) = (y as f32, cb as f32, cr as f32);
    let r = cr * (2.0 - 2.0*KR) + y;
    let b = cb * (2.0 - 2.0*KB) + y;
    let g = (y - KB*b - KR*r) / KG;
    pack_rgb(clamp_to_u8(r + 128.0), clamp_to_u8(g + 128.0), clamp_to_u8(b + 128.0))
}

#[inline]
fn clamp_to_u8(x: f32) -> u8 {
    let x = x.round();
    if x <= 0.0 { return 0; }
    if 255.0 <= x { return 255; }
    x as u8
}

// ------------------------------------------------------------
// Renderer

/// Decodes a baseline JPEG source straight into a `PixelSink`.
pub struct JpegRenderer {
    source   : Source,
    opts     : JpegOptions,
    hdr      : Option<JpegHeader>,
    cache    : PixelCache,
    rendered : bool,
}

impl JpegRenderer {
    /// Fails if `opts.quality` is outside 1 to 8.
    pub fn new<S: Into<Source>>(source: S, opts: JpegOptions) -> Result<JpegRenderer> {
        if opts.quality < 1 || 8 < opts.quality {
            return Err(Error::InvalidOption("quality must be between 1 and 8"));
        }
        Ok(JpegRenderer {
            source   : source.into(),
            opts     : opts,
            hdr      : None,
            cache    : PixelCache::new(),
            rendered : false,
        })
    }

    /// Like `metadata` but returns the raw frame header.
    pub fn header(&mut self) -> Result<Option<JpegHeader>> {
        if self.hdr.is_none() {
            let reader = &mut self.source.open()?;
            self.hdr = read_header(reader)?;
        }
        Ok(self.hdr)
    }
}

impl Renderer for JpegRenderer {
    fn metadata(&mut self) -> Result<Option<ImageMetadata>> {
        Ok(self.header()?.map(|h| h.metadata()))
    }

    fn render(&mut self, opts: &RenderOptions, sink: &mut dyn PixelSink) -> Result<()> {
        if self.rendered {
            if !self.opts.cache {
                return Err(Error::AlreadyRendered);
            }
            if let Some(hdr) = self.hdr {
                self.cache.replay(opts.x, opts.y, hdr.width as u32, sink);
            }
            return Ok(());
        }

        if let Some(color) = opts.placeholder {
            if let Some(hdr) = self.header()? {
                sink.placeholder(opts.x, opts.y, hdr.width as u32, hdr.height as u32, color);
            }
        }

        self.cache.clear();
        let cache = if self.opts.cache { Some(&mut self.cache) } else { None };
        let out = &mut Emitter::new(opts.x, opts.y, sink, cache);
        let reader = &mut self.source.open()?;
        let hdr = decode(reader, self.opts.quality, out)?;
        // DNL may have filled in the height
        if hdr.is_some() {
            self.hdr = hdr;
        }
        self.rendered = true;
        Ok(())
    }
}

pub fn boxed(source: Source, opts: JpegOptions) -> Result<Box<dyn Renderer>> {
    Ok(Box::new(JpegRenderer::new(source, opts)?))
}
