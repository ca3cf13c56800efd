extern crate deflate;
extern crate streamdec;

use streamdec::{
    ColType, Format, Bounds, Error, ImageMetadata, JpegOptions, PixelSink, PngOptions,
    RenderOptions, Renderer, Source, PLACEHOLDER_COLOR,
};
use streamdec::jpeg::JpegRenderer;
use streamdec::png::PngRenderer;

type Pixels = Vec<(i32, i32, u32)>;

fn render(r: &mut dyn Renderer, opts: &RenderOptions) -> streamdec::Result<Pixels> {
    let mut px = Vec::new();
    r.render(opts, &mut |x: i32, y: i32, c: u32| px.push((x, y, c)))?;
    Ok(px)
}

fn close(a: u32, b: u32) -> bool {
    (0 .. 3).all(|i| {
        let (ca, cb) = ((a >> (i*8)) & 0xff, (b >> (i*8)) & 0xff);
        ca.max(cb) - ca.min(cb) <= 2
    })
}

// ------------------------------------------------------------
// JPEG fixtures

fn segment(out: &mut Vec<u8>, marker: u8, data: &[u8]) {
    out.extend_from_slice(&[0xff, marker]);
    out.extend_from_slice(&(data.len() as u16 + 2).to_be_bytes());
    out.extend_from_slice(data);
}

// DQT of all 8s, a dc table with "0" -> category 0 and "1" -> category 7,
// an ac table with only "0" -> end of block.
fn jpeg_tables(out: &mut Vec<u8>) {
    let mut dqt = vec![0u8];
    dqt.extend_from_slice(&[8; 64]);
    segment(out, 0xdb, &dqt);

    let mut dht = vec![0x00, 2];
    dht.extend_from_slice(&[0; 15]);
    dht.extend_from_slice(&[0x00, 0x07]);
    segment(out, 0xc4, &dht);

    let mut dht = vec![0x10, 1];
    dht.extend_from_slice(&[0; 15]);
    dht.push(0x00);
    segment(out, 0xc4, &dht);
}

// `comps` are the component ids, all with 1x1 sampling and table 0.
fn jpeg(w: u16, h: u16, comps: &[u8], restart: Option<u16>, entropy: &[u8],
                                                            trailer: &[u8]) -> Vec<u8>
{
    let comps: Vec<(u8, u8)> = comps.iter().map(|&id| (id, 0x11)).collect();
    jpeg_sampled(w, h, &comps, restart, entropy, trailer)
}

// `comps` are (id, sampling factors) pairs.
fn jpeg_sampled(w: u16, h: u16, comps: &[(u8, u8)], restart: Option<u16>, entropy: &[u8],
                                                                     trailer: &[u8]) -> Vec<u8>
{
    let mut out = vec![0xff, 0xd8];
    segment(&mut out, 0xe0, b"JFIF\0\x01\x01\0\0\x01\0\x01\0\0");
    jpeg_tables(&mut out);
    if let Some(ri) = restart {
        segment(&mut out, 0xdd, &ri.to_be_bytes());
    }

    let mut sof = vec![8];
    sof.extend_from_slice(&h.to_be_bytes());
    sof.extend_from_slice(&w.to_be_bytes());
    sof.push(comps.len() as u8);
    for &(id, hv) in comps {
        sof.extend_from_slice(&[id, hv, 0]);
    }
    segment(&mut out, 0xc0, &sof);

    let mut sos = vec![comps.len() as u8];
    for &(id, _) in comps {
        sos.extend_from_slice(&[id, 0x00]);
    }
    sos.extend_from_slice(&[0, 63, 0]);
    segment(&mut out, 0xda, &sos);

    out.extend_from_slice(entropy);
    out.extend_from_slice(trailer);
    out
}

// One MCU: Y dc +64 (sample 64 after the IDCT, 0xc0 on screen), chroma zero.
const FLAT_MCU: [u8; 2] = [0xc0, 0x07];

fn flat_2x2() -> Vec<u8> {
    jpeg(2, 2, &[1, 2, 3], None, &FLAT_MCU, &[0xff, 0xd9])
}

#[test]
fn jpeg_metadata() {
    let mut r = JpegRenderer::new(flat_2x2(), JpegOptions::default()).unwrap();
    let meta = r.metadata().unwrap().unwrap();
    assert_eq!(meta, ImageMetadata {
        width: 2, height: 2, bit_depth: 8, color: ColType::Color, format: Format::Jpeg,
    });
    let hdr = r.header().unwrap().unwrap();
    assert_eq!((hdr.num_comps, hdr.sof), (3, 0xc0));
}

#[test]
fn jpeg_flat_color() {
    let mut r = JpegRenderer::new(flat_2x2(), JpegOptions::default()).unwrap();
    let mut px = render(&mut r, &RenderOptions::default()).unwrap();
    px.sort();
    assert_eq!(px.len(), 4);
    let coords: Vec<(i32, i32)> = px.iter().map(|p| (p.0, p.1)).collect();
    assert_eq!(coords, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    for &(_, _, c) in &px {
        assert!(close(c, 0xc0c0c0), "{:06x}", c);
    }
}

#[test]
fn jpeg_every_quality() {
    for q in 1 .. 9 {
        let mut r = JpegRenderer::new(flat_2x2(), JpegOptions { quality: q, cache: false })
            .unwrap();
        let px = render(&mut r, &RenderOptions::default()).unwrap();
        assert_eq!(px.len(), 4);
        assert!(px.iter().all(|p| p.2 == 0xc0c0c0), "quality {}", q);
    }
}

#[test]
fn jpeg_quality_out_of_range() {
    for &q in &[0, 9, 255] {
        match JpegRenderer::new(flat_2x2(), JpegOptions { quality: q, cache: true }) {
            Err(Error::InvalidOption(_)) => {}
            Err(e) => panic!("quality {}: {}", q, e),
            Ok(_) => panic!("quality {} accepted", q),
        }
    }
}

#[test]
fn jpeg_cache_replay() {
    let opts = JpegOptions { quality: 8, cache: true };
    let mut r = JpegRenderer::new(flat_2x2(), opts).unwrap();
    let first = render(&mut r, &RenderOptions::default()).unwrap();
    let again = render(&mut r, &RenderOptions { x: 5, y: -7, ..Default::default() }).unwrap();
    let moved: Pixels = first.iter().map(|&(x, y, c)| (x + 5, y - 7, c)).collect();
    assert_eq!(again, moved);
}

#[test]
fn jpeg_subsampled_chroma() {
    // 16x16 4:2:0, one MCU: four luma blocks with dc diffs +64, -64, 0, +64,
    // then gray cb and cr
    let entropy = [0xc0, 0x5f, 0x8c, 0x00, 0x7f];
    let data = jpeg_sampled(16, 16, &[(1, 0x22), (2, 0x11), (3, 0x11)], None,
                            &entropy, &[0xff, 0xd9]);
    let mut r = JpegRenderer::new(data, JpegOptions { quality: 8, cache: true }).unwrap();
    let first = render(&mut r, &RenderOptions::default()).unwrap();
    assert_eq!(first.len(), 256);

    let mut seen = vec![false; 256];
    for &(x, y, c) in &first {
        assert!(0 <= x && x < 16 && 0 <= y && y < 16, "({}, {})", x, y);
        seen[(y * 16 + x) as usize] = true;
        let want = if (x < 8) == (y < 8) { 0xc0c0c0 } else { 0x808080 };
        assert!(close(c, want), "({}, {}): {:06x}", x, y, c);
    }
    assert!(seen.iter().all(|&s| s));

    let again = render(&mut r, &RenderOptions { x: -3, y: 40, ..Default::default() }).unwrap();
    let moved: Pixels = first.iter().map(|&(x, y, c)| (x - 3, y + 40, c)).collect();
    assert_eq!(again, moved);
}

#[test]
fn jpeg_renders_once_without_cache() {
    let mut r = JpegRenderer::new(flat_2x2(), JpegOptions::default()).unwrap();
    render(&mut r, &RenderOptions::default()).unwrap();
    match render(&mut r, &RenderOptions::default()) {
        Err(Error::AlreadyRendered) => {}
        other => panic!("{:?}", other),
    }
}

#[test]
fn jpeg_gray_restart_interval() {
    // 10x3 gray, two MCUs with a restart between them. The second MCU's dc
    // diff of 0 only gives gray 0x80 if the predictor was reset.
    let entropy = [0xc0, 0x7f, 0xff, 0xd0, 0x3f];
    let data = jpeg(10, 3, &[1], Some(1), &entropy, &[0xff, 0xd9]);
    let mut r = JpegRenderer::new(data, JpegOptions::default()).unwrap();
    assert_eq!(r.metadata().unwrap().unwrap().color, ColType::Gray);

    let px = render(&mut r, &RenderOptions::default()).unwrap();
    assert_eq!(px.len(), 30);
    for &(x, y, c) in &px {
        assert!(0 <= y && y < 3);
        let expected = if x < 8 { 0xc0c0c0 } else { 0x808080 };
        assert_eq!(c, expected, "pixel {},{}", x, y);
    }
    // mcu order: all of the first block before the clipped second one
    assert_eq!(px[23], (7, 2, 0xc0c0c0));
    assert_eq!(px[24], (8, 0, 0x808080));
}

#[test]
fn jpeg_truncated_data_still_renders() {
    let data = jpeg(2, 2, &[1, 2, 3], None, &FLAT_MCU[..1], &[]);
    let mut r = JpegRenderer::new(data, JpegOptions::default()).unwrap();
    let px = render(&mut r, &RenderOptions::default()).unwrap();
    assert_eq!(px.len(), 4);
    assert!(px.iter().all(|p| p.2 == 0xc0c0c0));
}

#[test]
fn jpeg_height_from_dnl() {
    let dnl = [0xff, 0xdc, 0x00, 0x04, 0x00, 0x02, 0xff, 0xd9];
    let data = jpeg(2, 0, &[1, 2, 3], None, &FLAT_MCU, &dnl);
    let mut r = JpegRenderer::new(data, JpegOptions::default()).unwrap();
    assert_eq!(r.metadata().unwrap().unwrap().height, 0);

    let px = render(&mut r, &RenderOptions::default()).unwrap();
    // one full MCU row, nothing for the cut off MCU after it
    assert_eq!(px.len(), 2 * 8);
    assert!(px.iter().all(|p| p.2 == 0xc0c0c0));
    assert_eq!(r.metadata().unwrap().unwrap().height, 2);
}

#[test]
fn jpeg_bounds() {
    let mut r = JpegRenderer::new(flat_2x2(), JpegOptions::default()).unwrap();
    let mut n = 0;
    let bounds = Bounds { max_width: Some(1), ..Default::default() };
    let done = r.check_and_render(&bounds, &RenderOptions::default(),
                                  &mut |_: i32, _: i32, _: u32| n += 1).unwrap();
    assert!(!done);
    assert_eq!(n, 0);

    let bounds = Bounds { max_width: Some(2), max_height: Some(2), max_area: Some(4) };
    let done = r.check_and_render(&bounds, &RenderOptions::default(),
                                  &mut |_: i32, _: i32, _: u32| n += 1).unwrap();
    assert!(done);
    assert_eq!(n, 4);
}

#[derive(Default)]
struct Recorder {
    placeholders : Vec<(i32, i32, u32, u32, u32)>,
    pixels       : usize,
}

impl PixelSink for Recorder {
    fn emit(&mut self, _x: i32, _y: i32, _rgb: u32) {
        assert_eq!(self.placeholders.len(), 1, "placeholder comes first");
        self.pixels += 1;
    }

    fn placeholder(&mut self, x: i32, y: i32, w: u32, h: u32, rgb: u32) {
        self.placeholders.push((x, y, w, h, rgb));
    }
}

#[test]
fn jpeg_placeholder() {
    let mut r = JpegRenderer::new(flat_2x2(), JpegOptions::default()).unwrap();
    let mut sink = Recorder::default();
    let opts = RenderOptions { x: 3, y: 4, placeholder: Some(PLACEHOLDER_COLOR) };
    r.render(&opts, &mut sink).unwrap();
    assert_eq!(sink.placeholders, vec![(3, 4, 2, 2, 0xbbbbbb)]);
    assert_eq!(sink.pixels, 4);
}

#[test]
fn jpeg_from_file() {
    let path = std::env::temp_dir().join(format!("streamdec-{}.jpg", std::process::id()));
    std::fs::write(&path, flat_2x2()).unwrap();

    let source = Source::from(path.as_path());
    assert_eq!(streamdec::detect(&source).unwrap(), Some(Format::Jpeg));
    let mut r = streamdec::open(source, JpegOptions::default(), PngOptions::default())
        .unwrap().unwrap();
    let px = render(&mut *r, &RenderOptions::default()).unwrap();
    assert_eq!(px.len(), 4);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn missing_file() {
    let mut r = JpegRenderer::new("no/such/image.jpg", JpegOptions::default()).unwrap();
    match r.metadata() {
        Err(Error::Io(_)) => {}
        other => panic!("{:?}", other),
    }
}

// ------------------------------------------------------------
// PNG fixtures

fn chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    out.extend_from_slice(&[0; 4]);     // crc, never checked
}

fn ihdr(w: u32, h: u32, depth: u8, color_type: u8, interlace: u8) -> Vec<u8> {
    let mut d = Vec::new();
    d.extend_from_slice(&w.to_be_bytes());
    d.extend_from_slice(&h.to_be_bytes());
    d.extend_from_slice(&[depth, color_type, 0, 0, interlace]);
    d
}

// `rows` are the scanlines with their filter type bytes.
fn png(w: u32, h: u32, depth: u8, color_type: u8, palette: Option<&[u8]>, rows: &[u8])
                                                                           -> Vec<u8>
{
    let mut out = vec![0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];
    chunk(&mut out, b"IHDR", &ihdr(w, h, depth, color_type, 0));
    if let Some(p) = palette {
        chunk(&mut out, b"PLTE", p);
    }
    chunk(&mut out, b"IDAT", &deflate::deflate_bytes_zlib(rows));
    chunk(&mut out, b"IEND", &[]);
    out
}

fn render_png(data: Vec<u8>, opts: PngOptions) -> streamdec::Result<Pixels> {
    let mut r = PngRenderer::new(data, opts);
    render(&mut r, &RenderOptions::default())
}

#[test]
fn png_single_gray_pixel() {
    let data = png(1, 1, 8, 0, None, &[0, 0x7f]);
    let mut r = PngRenderer::new(data.clone(), PngOptions::default());
    assert_eq!(r.metadata().unwrap().unwrap(), ImageMetadata {
        width: 1, height: 1, bit_depth: 8, color: ColType::Gray, format: Format::Png,
    });
    assert_eq!(render_png(data, PngOptions::default()).unwrap(), vec![(0, 0, 0x7f7f7f)]);
}

#[test]
fn png_paeth_matches_unfiltered() {
    let plain = [0, 10, 20, 30,
                 0, 40, 35, 90];
    let paeth = [4, 10, 10, 10,
                 4, 30, 251, 55];
    let a = render_png(png(3, 2, 8, 0, None, &plain), PngOptions::default()).unwrap();
    let b = render_png(png(3, 2, 8, 0, None, &paeth), PngOptions::default()).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, vec![
        (0, 0, 0x0a0a0a), (1, 0, 0x141414), (2, 0, 0x1e1e1e),
        (0, 1, 0x282828), (1, 1, 0x232323), (2, 1, 0x5a5a5a),
    ]);
}

#[test]
fn png_every_filter() {
    // rgb 2x2, rows filtered with sub, up, average
    let plain = [0, 1, 2, 3, 5, 7, 9,
                 0, 4, 4, 4, 200, 100, 50];
    let filtered = [1, 1, 2, 3, 4, 5, 6,
                    2, 3, 2, 1, 195, 93, 41];
    let avg = [3, 1, 2, 3, 5, 6, 8,
               3, 4, 3, 3, 196, 95, 44];
    let want = render_png(png(2, 2, 8, 2, None, &plain), PngOptions::default()).unwrap();
    assert_eq!(want[3], (1, 1, 0xc86432));
    for rows in &[&filtered[..], &avg[..]] {
        let got = render_png(png(2, 2, 8, 2, None, rows), PngOptions::default()).unwrap();
        assert_eq!(got, want);
    }
}

#[test]
fn png_split_idat() {
    let rows = [0, 255, 0, 0, 0, 0, 255];
    let z = deflate::deflate_bytes_zlib(&rows);
    let (first, second) = z.split_at(z.len() / 2);

    let mut data = vec![0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];
    chunk(&mut data, b"IHDR", &ihdr(2, 1, 8, 2, 0));
    chunk(&mut data, b"tEXt", b"Comment\0split");
    chunk(&mut data, b"IDAT", first);
    chunk(&mut data, b"IDAT", second);
    chunk(&mut data, b"IEND", &[]);

    let px = render_png(data, PngOptions::default()).unwrap();
    assert_eq!(px, vec![(0, 0, 0xff0000), (1, 0, 0x0000ff)]);
}

#[test]
fn png_palette() {
    let plte = [1, 2, 3, 10, 20, 30, 255, 0, 0];
    // 2-bit indices 2, 1, 0, 3 packed high bits first; 3 is past the palette
    let data = png(4, 1, 2, 3, Some(&plte), &[0, 0b10_01_00_11]);
    let px = render_png(data, PngOptions::default()).unwrap();
    assert_eq!(px, vec![
        (0, 0, 0xff0000), (1, 0, 0x0a141e), (2, 0, 0x010203), (3, 0, 0x000000),
    ]);
}

#[test]
fn png_sub_byte_gray() {
    // 1-bit gray: 1 0 1 scaled to full range
    let data = png(3, 1, 1, 0, None, &[0, 0b1010_0000]);
    let px = render_png(data, PngOptions::default()).unwrap();
    assert_eq!(px, vec![(0, 0, 0xffffff), (1, 0, 0x000000), (2, 0, 0xffffff)]);
}

#[test]
fn png_16_bit_keeps_high_byte() {
    let data = png(2, 1, 16, 0, None, &[0, 0x12, 0x34, 0xfe, 0xff]);
    let px = render_png(data, PngOptions::default()).unwrap();
    assert_eq!(px, vec![(0, 0, 0x121212), (1, 0, 0xfefefe)]);
}

#[test]
fn png_alpha() {
    let rows = [0, 255, 0, 0, 255,
                   0, 255, 0, 0,
                   0, 0, 255, 128];
    let data = png(3, 1, 8, 6, None, &rows);

    let fast = render_png(data.clone(), PngOptions::default()).unwrap();
    assert_eq!(fast, vec![(0, 0, 0xff0000), (2, 0, 0x0000ff)]);

    let precise = PngOptions { cache: false, bg: [255, 255, 255], fast_alpha: false };
    let blended = render_png(data, precise).unwrap();
    assert_eq!(blended, vec![(0, 0, 0xff0000), (2, 0, 0x7f7fff)]);
}

#[test]
fn png_gray_alpha() {
    let data = png(2, 1, 8, 4, None, &[0, 0x40, 255, 0x90, 0]);
    let px = render_png(data, PngOptions::default()).unwrap();
    assert_eq!(px, vec![(0, 0, 0x404040)]);
}

#[test]
fn png_cache_replay_skips_transparent() {
    let rows = [0, 9, 9, 9, 255, 0, 0, 0, 0,
                0, 0, 0, 0, 0,   7, 7, 7, 255];
    let opts = PngOptions { cache: true, ..Default::default() };
    let mut r = PngRenderer::new(png(2, 2, 8, 6, None, &rows), opts);
    let first = render(&mut r, &RenderOptions::default()).unwrap();
    assert_eq!(first, vec![(0, 0, 0x090909), (1, 1, 0x070707)]);

    let again = render(&mut r, &RenderOptions { x: 100, y: 50, ..Default::default() }).unwrap();
    assert_eq!(again, vec![(100, 50, 0x090909), (101, 51, 0x070707)]);
}

#[test]
fn png_renders_once_without_cache() {
    let mut r = PngRenderer::new(png(1, 1, 8, 0, None, &[0, 1]), PngOptions::default());
    render(&mut r, &RenderOptions::default()).unwrap();
    match render(&mut r, &RenderOptions::default()) {
        Err(Error::AlreadyRendered) => {}
        other => panic!("{:?}", other),
    }
}

#[test]
fn png_bad_signature() {
    let mut data = png(1, 1, 8, 0, None, &[0, 1]);
    data[1] = b'Q';
    let mut r = PngRenderer::new(data.clone(), PngOptions::default());
    assert_eq!(r.metadata().unwrap(), None);
    assert_eq!(streamdec::detect(&Source::from(data)).unwrap(), None);
}

#[test]
fn png_rejects() {
    // interlaced
    let mut data = vec![0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];
    chunk(&mut data, b"IHDR", &ihdr(1, 1, 8, 0, 1));
    chunk(&mut data, b"IDAT", &deflate::deflate_bytes_zlib(&[0, 1]));
    chunk(&mut data, b"IEND", &[]);
    match render_png(data, PngOptions::default()) {
        Err(Error::Unsupported(_)) => {}
        other => panic!("{:?}", other),
    }

    // rgb can't be 4 bits deep
    match render_png(png(1, 1, 4, 2, None, &[0, 0]), PngOptions::default()) {
        Err(Error::Unsupported(_)) => {}
        other => panic!("{:?}", other),
    }

    // two rows declared, one present
    match render_png(png(1, 2, 8, 0, None, &[0, 1]), PngOptions::default()) {
        Err(Error::InvalidData(_)) => {}
        other => panic!("{:?}", other),
    }

    match render_png(png(1, 1, 8, 0, None, &[5, 1]), PngOptions::default()) {
        Err(Error::InvalidData(_)) => {}
        other => panic!("{:?}", other),
    }
}

#[test]
fn png_dimension_limits() {
    for &(w, h) in &[(0, 1), (3, 0), (0x8000_0000, 1), (1, 0xffff_ffff)] {
        let mut r = PngRenderer::new(png(w, h, 8, 0, None, &[0, 1]), PngOptions::default());
        match r.metadata() {
            Err(Error::InvalidData(_)) => {}
            other => panic!("{}x{}: {:?}", w, h, other),
        }
        match render_png(png(w, h, 8, 0, None, &[0, 1]), PngOptions::default()) {
            Err(Error::InvalidData(_)) => {}
            other => panic!("{}x{}: {:?}", w, h, other),
        }
    }
}

#[test]
fn png_huge_header_small_data() {
    let data = png(0x7fff_ffff, 0x7fff_ffff, 16, 6, None, &[0; 9]);
    let mut r = PngRenderer::new(data.clone(), PngOptions::default());
    let meta = r.metadata().unwrap().unwrap();
    assert_eq!((meta.width, meta.height), (0x7fff_ffff, 0x7fff_ffff));
    match render_png(data, PngOptions::default()) {
        Err(Error::InvalidData(_)) => {}
        other => panic!("{:?}", other),
    }
}

#[test]
fn open_detects_format() {
    let mut r = streamdec::open(png(1, 1, 8, 0, None, &[0, 0x33]),
                                JpegOptions::default(), PngOptions::default())
        .unwrap().unwrap();
    assert_eq!(r.metadata().unwrap().unwrap().format, Format::Png);
    assert_eq!(render(&mut *r, &RenderOptions::default()).unwrap(), vec![(0, 0, 0x333333)]);

    let r = streamdec::open(flat_2x2(), JpegOptions::default(), PngOptions::default())
        .unwrap();
    assert!(r.is_some());

    let gif = b"GIF89a\x01\x00\x01\x00".to_vec();
    let r = streamdec::open(gif, JpegOptions::default(), PngOptions::default()).unwrap();
    assert!(r.is_none());
}
