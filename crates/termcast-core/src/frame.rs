//! Binary encoding of terminal screen state.
//!
//! A buffer frame is laid out as:
//!
//! ```text
//! magic u16 LE (0x5654) | version u8 | cols u32 LE | rows u32 LE
//! | cursor_x u32 LE | cursor_y u32 LE | rows of cells
//! ```
//!
//! Each row is either `0xFE 0x01` (blank) or `0xFD`, a u16 LE cell count
//! with trailing blanks trimmed, and the cells. A push to a subscriber
//! prefixes the frame with `0xBF`, a u32 LE id length and the session id.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

pub const FRAME_MAGIC: u16 = 0x5654;
pub const FRAME_VERSION: u8 = 1;
pub const BROADCAST_MAGIC: u8 = 0xbf;

const HEADER_LEN: usize = 2 + 1 + 4 * 4;
const ROW_EMPTY: u8 = 0xfe;
const ROW_CELLS: u8 = 0xfd;

const TYPE_EXTENDED: u8 = 0x80;
const TYPE_UNICODE: u8 = 0x40;
const TYPE_FG: u8 = 0x20;
const TYPE_BG: u8 = 0x10;
const TYPE_FG_RGB: u8 = 0x08;
const TYPE_BG_RGB: u8 = 0x04;
const CHAR_ASCII: u8 = 0x01;
const CHAR_UNICODE: u8 = 0x02;

const ATTR_BOLD: u8 = 0x01;
const ATTR_ITALIC: u8 = 0x02;
const ATTR_UNDERLINE: u8 = 0x04;
const ATTR_INVERSE: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CellColor {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl CellColor {
    fn is_default(&self) -> bool {
        matches!(self, CellColor::Default)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cell {
    /// Grapheme shown in the cell; empty for the trailing half of a wide char.
    pub contents: String,
    pub fg: CellColor,
    pub bg: CellColor,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub inverse: bool,
}

impl Cell {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            ..Self::default()
        }
    }

    fn is_space(&self) -> bool {
        self.contents.is_empty() || self.contents == " "
    }

    fn attr_bits(&self) -> u8 {
        let mut attrs = 0;
        if self.bold {
            attrs |= ATTR_BOLD;
        }
        if self.italic {
            attrs |= ATTR_ITALIC;
        }
        if self.underline {
            attrs |= ATTR_UNDERLINE;
        }
        if self.inverse {
            attrs |= ATTR_INVERSE;
        }
        attrs
    }

    fn is_extended(&self) -> bool {
        self.attr_bits() != 0 || !self.fg.is_default() || !self.bg.is_default()
    }

    fn is_blank(&self) -> bool {
        self.is_space() && !self.is_extended()
    }
}

/// Owned copy of a terminal's visible screen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TerminalSnapshot {
    pub cols: u16,
    pub rows: u16,
    pub cursor_x: u16,
    pub cursor_y: u16,
    /// Row-major; may hold fewer rows than `rows`, the rest encode as blank.
    pub cells: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub cols: u32,
    pub rows: u32,
    pub cursor_x: u32,
    pub cursor_y: u32,
}

impl FrameHeader {
    /// Reads the fixed header of a buffer frame.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < HEADER_LEN {
            return None;
        }
        let mut buf = frame;
        if buf.get_u16_le() != FRAME_MAGIC {
            return None;
        }
        Some(Self {
            version: buf.get_u8(),
            cols: buf.get_u32_le(),
            rows: buf.get_u32_le(),
            cursor_x: buf.get_u32_le(),
            cursor_y: buf.get_u32_le(),
        })
    }
}

pub struct BufferEncoder;

impl BufferEncoder {
    /// Encodes a snapshot. Equal snapshots always produce equal bytes.
    pub fn encode(snapshot: &TerminalSnapshot) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + snapshot.rows as usize * 4);
        buf.put_u16_le(FRAME_MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u32_le(u32::from(snapshot.cols));
        buf.put_u32_le(u32::from(snapshot.rows));
        buf.put_u32_le(u32::from(snapshot.cursor_x));
        buf.put_u32_le(u32::from(snapshot.cursor_y));

        for row in 0..snapshot.rows as usize {
            let cells = snapshot
                .cells
                .get(row)
                .map(Vec::as_slice)
                .unwrap_or_default();
            encode_row(&mut buf, cells, snapshot.cols as usize);
        }
        buf.freeze()
    }
}

fn encode_row(buf: &mut BytesMut, cells: &[Cell], cols: usize) {
    let cells = &cells[..cells.len().min(cols)];
    let Some(last) = cells.iter().rposition(|c| !c.is_blank()) else {
        buf.put_u8(ROW_EMPTY);
        buf.put_u8(1);
        return;
    };
    let cells = &cells[..=last];
    buf.put_u8(ROW_CELLS);
    // Bounded by `cols`, which is a u16.
    buf.put_u16_le(cells.len() as u16);
    for cell in cells {
        encode_cell(buf, cell);
    }
}

fn encode_cell(buf: &mut BytesMut, cell: &Cell) {
    if cell.is_blank() {
        buf.put_u8(0x00);
        return;
    }

    let mut type_byte = 0u8;
    if cell.is_extended() {
        type_byte |= TYPE_EXTENDED;
    }

    let ascii = !cell.is_space() && cell.contents.len() == 1 && cell.contents.is_ascii();
    let unicode = !cell.is_space() && !ascii;
    if unicode {
        type_byte |= TYPE_UNICODE | CHAR_UNICODE;
    } else if ascii {
        type_byte |= CHAR_ASCII;
    }

    match cell.fg {
        CellColor::Default => {}
        CellColor::Indexed(_) => type_byte |= TYPE_FG,
        CellColor::Rgb(..) => type_byte |= TYPE_FG | TYPE_FG_RGB,
    }
    match cell.bg {
        CellColor::Default => {}
        CellColor::Indexed(_) => type_byte |= TYPE_BG,
        CellColor::Rgb(..) => type_byte |= TYPE_BG | TYPE_BG_RGB,
    }
    buf.put_u8(type_byte);

    if ascii {
        buf.put_u8(cell.contents.as_bytes()[0]);
    } else if unicode {
        let text = truncate_utf8(&cell.contents, u8::MAX as usize);
        buf.put_u8(text.len() as u8);
        buf.put_slice(text.as_bytes());
    }

    if type_byte & TYPE_EXTENDED != 0 {
        buf.put_u8(cell.attr_bits());
        put_color(buf, cell.fg);
        put_color(buf, cell.bg);
    }
}

fn put_color(buf: &mut BytesMut, color: CellColor) {
    match color {
        CellColor::Default => {}
        CellColor::Indexed(idx) => buf.put_u8(idx),
        CellColor::Rgb(r, g, b) => buf.put_slice(&[r, g, b]),
    }
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Prefixes a buffer frame with the session it belongs to.
pub fn encode_broadcast(session_id: &str, frame: &[u8]) -> Bytes {
    let id = session_id.as_bytes();
    let mut buf = BytesMut::with_capacity(1 + 4 + id.len() + frame.len());
    buf.put_u8(BROADCAST_MAGIC);
    buf.put_u32_le(id.len() as u32);
    buf.put_slice(id);
    buf.put_slice(frame);
    buf.freeze()
}

/// Splits a broadcast message into session id and buffer frame.
pub fn parse_broadcast(message: &[u8]) -> Option<(&str, &[u8])> {
    let (&magic, rest) = message.split_first()?;
    if magic != BROADCAST_MAGIC || rest.len() < 4 {
        return None;
    }
    let (len, rest) = rest.split_at(4);
    let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() < len {
        return None;
    }
    let (id, frame) = rest.split_at(len);
    Some((std::str::from_utf8(id).ok()?, frame))
}
