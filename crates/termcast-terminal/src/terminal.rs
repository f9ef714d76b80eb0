use std::sync::Mutex;

use termcast_common::mutex_lock_or_recover;
use termcast_core::Cell;
use termcast_core::CellColor;
use termcast_core::TerminalSnapshot;
use vt100::Parser;

const MAX_SCROLLBACK: usize = 1000;

/// Screen state of one session, fed with the bytes its viewers see.
pub struct VirtualTerminal {
    parser: Mutex<Parser>,
}

impl VirtualTerminal {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: Mutex::new(Parser::new(rows, cols, MAX_SCROLLBACK)),
        }
    }

    pub fn process(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        mutex_lock_or_recover(&self.parser).process(data);
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        mutex_lock_or_recover(&self.parser).set_size(rows, cols);
    }

    pub fn size(&self) -> (u16, u16) {
        let parser = mutex_lock_or_recover(&self.parser);
        let (rows, cols) = parser.screen().size();
        (cols, rows)
    }

    /// Title most recently set through `OSC 0` or `OSC 2`.
    pub fn title(&self) -> String {
        mutex_lock_or_recover(&self.parser)
            .screen()
            .title()
            .to_string()
    }

    /// Copies the visible screen, including per-cell colours and attributes.
    pub fn snapshot(&self) -> TerminalSnapshot {
        let parser = mutex_lock_or_recover(&self.parser);
        let screen = parser.screen();
        let (rows, cols) = screen.size();
        let (cursor_row, cursor_col) = screen.cursor_position();

        let mut cells = Vec::with_capacity(rows as usize);
        for row in 0..rows {
            let mut row_cells = Vec::with_capacity(cols as usize);
            for col in 0..cols {
                let cell = match screen.cell(row, col) {
                    Some(cell) if !cell.is_wide_continuation() => Cell {
                        contents: cell.contents(),
                        fg: convert_color(cell.fgcolor()),
                        bg: convert_color(cell.bgcolor()),
                        bold: cell.bold(),
                        italic: cell.italic(),
                        underline: cell.underline(),
                        inverse: cell.inverse(),
                    },
                    _ => Cell::default(),
                };
                row_cells.push(cell);
            }
            cells.push(row_cells);
        }

        TerminalSnapshot {
            cols,
            rows,
            cursor_x: cursor_col,
            cursor_y: cursor_row,
            cells,
        }
    }

    pub fn screen_text(&self) -> String {
        let parser = mutex_lock_or_recover(&self.parser);
        let mut lines: Vec<String> = parser
            .screen()
            .rows(0, u16::MAX)
            .map(|line| line.trim_end().to_string())
            .collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }
}

fn convert_color(color: vt100::Color) -> CellColor {
    match color {
        vt100::Color::Default => CellColor::Default,
        vt100::Color::Idx(idx) => CellColor::Indexed(idx),
        vt100::Color::Rgb(r, g, b) => CellColor::Rgb(r, g, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_terminal() {
        let term = VirtualTerminal::new(80, 24);
        term.process(b"Hello, World!\r\nsecond");
        assert_eq!(term.screen_text(), "Hello, World!\nsecond");
    }

    #[test]
    fn test_snapshot_cursor_and_style() {
        let term = VirtualTerminal::new(20, 5);
        term.process(b"\x1b[1;31mAB\x1b[0mC");
        let snapshot = term.snapshot();
        assert_eq!((snapshot.cols, snapshot.rows), (20, 5));
        assert_eq!((snapshot.cursor_x, snapshot.cursor_y), (3, 0));
        assert_eq!(snapshot.cells.len(), 5);
        assert_eq!(snapshot.cells[0].len(), 20);

        let a = &snapshot.cells[0][0];
        assert_eq!(a.contents, "A");
        assert!(a.bold);
        assert_eq!(a.fg, CellColor::Indexed(1));
        assert!(!snapshot.cells[0][2].bold);
    }

    #[test]
    fn test_title_tracking() {
        let term = VirtualTerminal::new(80, 24);
        term.process(b"\x1b]2;my title\x07");
        assert_eq!(term.title(), "my title");
    }

    #[test]
    fn test_resize() {
        let term = VirtualTerminal::new(80, 24);
        term.resize(100, 30);
        assert_eq!(term.size(), (100, 30));
        assert_eq!(term.snapshot().rows, 30);
    }

    #[test]
    fn test_identical_input_gives_identical_snapshots() {
        let a = VirtualTerminal::new(10, 3);
        let b = VirtualTerminal::new(10, 3);
        for term in [&a, &b] {
            term.process("x\x1b[32m漢\x1b[0m\r\n".as_bytes());
        }
        assert_eq!(a.snapshot(), b.snapshot());
    }
}
