use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bytecode::compile_error::CompileError;
use crate::lang::std_fn::{Library, StdFunction};
use crate::runtime::runtime_error::{RuntimeError, RuntimeResult};

/// An entry of a page's constant table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// A user-defined function, by page index.
    Page(u16),
    /// A library function, by index into [`Program::library`].
    StdFunction(u16),
    StructShape { name: String, fields: Vec<String> },
}

// Floats compare by bit pattern so that every constant dedupes by
// (type, value) identity.
impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Nil, Constant::Nil) => true,
            (Constant::Boolean(a), Constant::Boolean(b)) => a == b,
            (Constant::Integer(a), Constant::Integer(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::String(a), Constant::String(b)) => a == b,
            (Constant::Page(a), Constant::Page(b)) => a == b,
            (Constant::StdFunction(a), Constant::StdFunction(b)) => a == b,
            (
                Constant::StructShape { name: a, fields: x },
                Constant::StructShape { name: b, fields: y },
            ) => a == b && x == y,
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Constant::Nil => {}
            Constant::Boolean(b) => b.hash(state),
            Constant::Integer(n) => n.hash(state),
            Constant::Float(n) => n.to_bits().hash(state),
            Constant::String(s) => s.hash(state),
            Constant::Page(index) | Constant::StdFunction(index) => index.hash(state),
            Constant::StructShape { name, fields } => {
                name.hash(state);
                fields.hash(state);
            }
        }
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Nil => write!(f, "nil"),
            Constant::Boolean(b) => write!(f, "{}", b),
            Constant::Integer(n) => write!(f, "{}", n),
            Constant::Float(n) => write!(f, "{:?}", n),
            Constant::String(s) => write!(f, "{:?}", s),
            Constant::Page(index) => write!(f, "<page {}>", index),
            Constant::StdFunction(index) => write!(f, "<std {}>", index),
            Constant::StructShape { name, fields } => {
                write!(f, "{} {{ {} }}", name, fields.join(", "))
            }
        }
    }
}

/// Append-only, deduplicated constant pool of one page. Slot 0 always
/// holds nil.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Constant>", into = "Vec<Constant>")]
pub struct ConstantTable {
    constants: Vec<Constant>,
    index: HashMap<Constant, u16>,
}

pub const NIL_CONSTANT: u16 = 0;

impl ConstantTable {
    pub fn new() -> Self {
        ConstantTable::from(Vec::new())
    }

    pub fn add(&mut self, constant: Constant) -> Result<u16, CompileError> {
        if let Some(key) = self.index.get(&constant) {
            return Ok(*key);
        }

        let key = u16::try_from(self.constants.len())
            .map_err(|_| CompileError::too_many_constants(self.constants.len()))?;
        self.constants.push(constant.clone());
        self.index.insert(constant, key);
        Ok(key)
    }

    pub fn get(&self, key: u16) -> Option<&Constant> {
        self.constants.get(usize::from(key))
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.constants.iter()
    }
}

impl Default for ConstantTable {
    fn default() -> Self {
        ConstantTable::new()
    }
}

impl From<Vec<Constant>> for ConstantTable {
    fn from(mut constants: Vec<Constant>) -> Self {
        if constants.first() != Some(&Constant::Nil) {
            constants.insert(0, Constant::Nil);
        }

        let mut index = HashMap::new();
        for (key, constant) in constants.iter().enumerate() {
            if let Ok(key) = u16::try_from(key) {
                index.entry(constant.clone()).or_insert(key);
            }
        }
        ConstantTable { constants, index }
    }
}

impl From<ConstantTable> for Vec<Constant> {
    fn from(table: ConstantTable) -> Self {
        table.constants
    }
}

/// One compiled function or top-level script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub name: String,
    pub arity: u8,
    pub code: Vec<u8>,
    pub constants: ConstantTable,
    /// `(offset, line)` pairs in increasing offset order.
    pub lines: Vec<(u32, u32)>,
}

impl Page {
    pub fn new(name: impl Into<String>, arity: u8) -> Self {
        Page {
            name: name.into(),
            arity,
            code: Vec::new(),
            constants: ConstantTable::new(),
            lines: Vec::new(),
        }
    }

    /// Source line of the instruction at `offset`.
    pub fn line_at(&self, offset: usize) -> Option<u32> {
        let offset = u32::try_from(offset).ok()?;
        let after = self.lines.partition_point(|(start, _)| *start <= offset);
        after.checked_sub(1).map(|i| self.lines[i].1)
    }

    pub fn mark_line(&mut self, line: u32) {
        let Ok(offset) = u32::try_from(self.code.len()) else {
            return;
        };
        match self.lines.last_mut() {
            Some((_, last)) if *last == line => {}
            Some((start, last)) if *start == offset => *last = line,
            _ => self.lines.push((offset, line)),
        }
    }

    /// Replace the instruction body with that of a recompiled definition.
    pub fn replace_body(&mut self, other: Page) {
        self.arity = other.arity;
        self.code = other.code;
        self.constants = other.constants;
        self.lines = other.lines;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub name: String,
    #[serde(skip)]
    pub function: Option<Arc<StdFunction>>,
}

/// A compiled program: every page plus the library functions its pages
/// refer to. `pages[0]` is the entry point of a fresh compile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub pages: Vec<Page>,
    pub library: Vec<LibraryEntry>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    pub fn page(&self, index: u16) -> Option<&Page> {
        self.pages.get(usize::from(index))
    }

    /// Index of a library function, registering it on first use.
    pub fn library_index(&mut self, function: &Arc<StdFunction>) -> Result<u16, CompileError> {
        if let Some(i) = self.library.iter().position(|entry| {
            entry
                .function
                .as_ref()
                .is_some_and(|f| Arc::ptr_eq(f, function))
        }) {
            return u16::try_from(i).map_err(|_| CompileError::too_many_constants(i));
        }

        let i = self.library.len();
        let key = u16::try_from(i).map_err(|_| CompileError::too_many_constants(i))?;
        self.library.push(LibraryEntry {
            name: function.name().to_string(),
            function: Some(Arc::clone(function)),
        });
        Ok(key)
    }

    pub fn library_function(&self, index: u16) -> RuntimeResult<&Arc<StdFunction>> {
        let entry = self.library.get(usize::from(index)).ok_or_else(|| {
            RuntimeError::internal(format!("library index {} out of range", index))
        })?;
        entry.function.as_ref().ok_or_else(|| {
            RuntimeError::custom(format!("unbound library function '{}'", entry.name))
        })
    }

    /// Attach library functions by name after decoding.
    pub fn bind(&mut self, library: &Library) -> RuntimeResult<()> {
        for entry in &mut self.library {
            let function = library.get(&entry.name).ok_or_else(|| {
                RuntimeError::custom(format!("unbound library function '{}'", entry.name))
            })?;
            entry.function = Some(Arc::clone(function));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Program, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Value;

    #[test]
    fn test_nil_is_always_slot_zero() {
        let mut table = ConstantTable::new();
        assert_eq!(table.get(NIL_CONSTANT), Some(&Constant::Nil));
        assert_eq!(table.add(Constant::Nil).unwrap(), NIL_CONSTANT);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_constants_are_deduplicated() {
        let mut table = ConstantTable::new();
        let a = table.add(Constant::Integer(7)).unwrap();
        let b = table.add(Constant::String("x".to_string())).unwrap();
        let c = table.add(Constant::Integer(7)).unwrap();

        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_integer_and_float_are_distinct_constants() {
        let mut table = ConstantTable::new();
        let int = table.add(Constant::Integer(1)).unwrap();
        let float = table.add(Constant::Float(1.0)).unwrap();
        assert_ne!(int, float);

        let nan = table.add(Constant::Float(f64::NAN)).unwrap();
        assert_eq!(table.add(Constant::Float(f64::NAN)).unwrap(), nan);
    }

    #[test]
    fn test_too_many_constants() {
        let mut table = ConstantTable::new();
        for i in 1..=u16::MAX {
            table.add(Constant::Integer(i64::from(i))).unwrap();
        }
        let err = table.add(Constant::Integer(-1)).unwrap_err();
        assert!(err.to_string().contains("too many constants"));
    }

    #[test]
    fn test_line_index() {
        let mut page = Page::new("main", 0);
        page.mark_line(1);
        page.code.extend([0, 0, 0]);
        page.mark_line(1);
        page.mark_line(4);
        page.code.push(0);

        assert_eq!(page.lines, vec![(0, 1), (3, 4)]);
        assert_eq!(page.line_at(0), Some(1));
        assert_eq!(page.line_at(2), Some(1));
        assert_eq!(page.line_at(3), Some(4));
    }

    #[test]
    fn test_program_encode_decode_and_bind() {
        let mut library = Library::new();
        let len = library.register(StdFunction::new("len", |_| Ok(Value::Integer(0))));

        let mut program = Program::new();
        let mut page = Page::new("<main>", 0);
        page.constants.add(Constant::Float(2.5)).unwrap();
        page.code.extend([1, 2, 3]);
        program.pages.push(page);
        assert_eq!(program.library_index(&len).unwrap(), 0);
        assert_eq!(program.library_index(&len).unwrap(), 0);

        let bytes = program.encode().unwrap();
        let mut decoded = Program::decode(&bytes).unwrap();
        assert_eq!(decoded.pages, program.pages);
        assert!(decoded.library_function(0).is_err());

        decoded.bind(&library).unwrap();
        assert_eq!(decoded.library_function(0).unwrap().name(), "len");

        let err = decoded.bind(&Library::new()).unwrap_err();
        assert!(err.to_string().contains("unbound library function 'len'"));
    }
}
