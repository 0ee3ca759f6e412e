use std::rc::Rc;

use crate::lang::value::Cell;

/// One active call.
#[derive(Debug, Clone)]
pub struct Frame {
    pub page: u16,
    /// Offset of the next instruction in `page`. For callers this is the
    /// return address.
    pub ip: usize,
    /// Stack index of local slot 0.
    pub base: usize,
    /// Whether program calls in root position stream to the terminal.
    pub is_root: bool,
    /// Closure environment, when the page is a closure body.
    pub captures: Option<Rc<[Cell]>>,
    /// Cells of the locals that closures capture, indexed by slot.
    pub cells: Vec<Option<Cell>>,
}

impl Frame {
    pub fn new(page: u16, base: usize, is_root: bool) -> Self {
        Frame {
            page,
            ip: 0,
            base,
            is_root,
            captures: None,
            cells: Vec::new(),
        }
    }

    pub fn with_captures(mut self, captures: Option<Rc<[Cell]>>) -> Self {
        self.captures = captures;
        self
    }

    pub fn cell(&self, slot: u8) -> Option<&Cell> {
        self.cells.get(usize::from(slot))?.as_ref()
    }

    pub fn set_cell(&mut self, slot: u8, cell: Cell) {
        let slot = usize::from(slot);
        if self.cells.len() <= slot {
            self.cells.resize(slot + 1, None);
        }
        self.cells[slot] = Some(cell);
    }
}

/// An open `try` region: what to restore when an error is caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    pub frame_depth: usize,
    pub stack_height: usize,
    pub iter_depth: usize,
    pub catch_ip: usize,
}
