//! Debug information for mapping bytecode to source code.
//!
//! Debug data lives in one varint-encoded stream per module. Function
//! headers carry offsets into the stream: one for the source-location table,
//! one for the lexical data (variable names per enclosing scope). Every
//! query returns `None` when the function has no entry.

/// A decoded source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub file_id: u32,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

/// Module-level debug info stream.
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    /// Source file names, indexed by `SourceLocation::file_id`.
    pub files: Vec<String>,
    /// The encoded stream. Offsets in function headers point in here.
    data: Vec<u8>,
    /// (function ID, string ID) pairs for functions whose source text was
    /// preserved.
    function_sources: Vec<(u32, u32)>,
}

impl DebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the source location covering `bytecode_offset` from the
    /// location table at `stream_offset`. The entry with the largest pc not
    /// beyond the target wins.
    pub fn source_location_at(
        &self,
        stream_offset: u32,
        bytecode_offset: u32,
    ) -> Option<SourceLocation> {
        let mut cursor = Cursor::new(&self.data, stream_offset as usize);
        let count = cursor.varint()?;
        let mut best: Option<(u32, SourceLocation)> = None;
        let mut pc = 0u32;
        for i in 0..count {
            // Deltas between consecutive pcs; the first entry is absolute.
            let delta = cursor.varint()?;
            pc = if i == 0 { delta } else { pc.checked_add(delta)? };
            let file_id = cursor.varint()?;
            let line = cursor.varint()?;
            let column = cursor.varint()?;
            if pc <= bytecode_offset {
                match best {
                    Some((best_pc, _)) if pc <= best_pc => {}
                    _ => best = Some((pc, SourceLocation { file_id, line, column })),
                }
            }
        }
        best.map(|(_, loc)| loc)
    }

    /// First location of the table at `stream_offset`: the location of the
    /// function itself.
    pub fn function_location(&self, stream_offset: u32) -> Option<SourceLocation> {
        let mut cursor = Cursor::new(&self.data, stream_offset as usize);
        let count = cursor.varint()?;
        if count == 0 {
            return None;
        }
        let _pc = cursor.varint()?;
        let file_id = cursor.varint()?;
        let line = cursor.varint()?;
        let column = cursor.varint()?;
        Some(SourceLocation { file_id, line, column })
    }

    /// Number of variables in each enclosing scope, innermost first, from
    /// the lexical table at `stream_offset`.
    pub fn lexical_variable_counts(&self, stream_offset: u32) -> Option<Vec<u32>> {
        let mut cursor = Cursor::new(&self.data, stream_offset as usize);
        let scope_count = cursor.varint()?;
        let mut counts = Vec::with_capacity(scope_count as usize);
        for _ in 0..scope_count {
            let var_count = cursor.varint()?;
            counts.push(var_count);
            for _ in 0..var_count {
                cursor.skip_string()?;
            }
        }
        Some(counts)
    }

    /// Name of variable `index` in the scope at `depth` (0 = innermost).
    pub fn lexical_variable_name(
        &self,
        stream_offset: u32,
        depth: u32,
        index: u32,
    ) -> Option<String> {
        let mut cursor = Cursor::new(&self.data, stream_offset as usize);
        let scope_count = cursor.varint()?;
        if depth >= scope_count {
            return None;
        }
        for d in 0..=depth {
            let var_count = cursor.varint()?;
            for v in 0..var_count {
                if d == depth && v == index {
                    return cursor.string();
                }
                cursor.skip_string()?;
            }
            if d == depth {
                // Index was out of range for the requested scope.
                return None;
            }
        }
        None
    }

    /// String ID of the preserved source of `function_id`, if any.
    pub fn function_source_id(&self, function_id: u32) -> Option<u32> {
        self.function_sources
            .iter()
            .find(|(id, _)| *id == function_id)
            .map(|(_, string_id)| *string_id)
    }
}

/// Read cursor over the debug stream.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Cursor { data, pos }
    }

    /// LEB128-style varint.
    fn varint(&mut self) -> Option<u32> {
        let mut result = 0u32;
        let mut shift = 0u32;
        loop {
            let byte = *self.data.get(self.pos)?;
            self.pos += 1;
            result |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Some(result);
            }
            shift += 7;
            if shift >= 32 {
                return None;
            }
        }
    }

    fn string(&mut self) -> Option<String> {
        let len = self.varint()? as usize;
        let bytes = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        String::from_utf8(bytes.to_vec()).ok()
    }

    fn skip_string(&mut self) -> Option<()> {
        let len = self.varint()? as usize;
        if self.pos + len > self.data.len() {
            return None;
        }
        self.pos += len;
        Some(())
    }
}

/// Builds the debug stream for a module.
#[derive(Default)]
pub struct DebugInfoBuilder {
    info: DebugInfo,
}

impl DebugInfoBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, name: &str) -> u32 {
        self.info.files.push(name.to_string());
        (self.info.files.len() - 1) as u32
    }

    /// Encode a source-location table. Entries are (bytecode offset,
    /// location), sorted ascending by offset; the first entry describes the
    /// function itself. Returns the stream offset for the header.
    pub fn add_source_locations(&mut self, entries: &[(u32, SourceLocation)]) -> u32 {
        let offset = self.info.data.len() as u32;
        self.varint(entries.len() as u32);
        let mut prev_pc = 0u32;
        for (i, (pc, loc)) in entries.iter().enumerate() {
            let delta = if i == 0 { *pc } else { pc - prev_pc };
            prev_pc = *pc;
            self.varint(delta);
            self.varint(loc.file_id);
            self.varint(loc.line);
            self.varint(loc.column);
        }
        offset
    }

    /// Encode lexical data: variable names per scope, innermost first.
    pub fn add_lexical_data(&mut self, scopes: &[Vec<String>]) -> u32 {
        let offset = self.info.data.len() as u32;
        self.varint(scopes.len() as u32);
        for scope in scopes {
            self.varint(scope.len() as u32);
            for name in scope {
                self.varint(name.len() as u32);
                self.info.data.extend_from_slice(name.as_bytes());
            }
        }
        offset
    }

    pub fn add_function_source(&mut self, function_id: u32, string_id: u32) {
        self.info.function_sources.push((function_id, string_id));
    }

    pub fn build(self) -> DebugInfo {
        self.info
    }

    fn varint(&mut self, mut v: u32) {
        loop {
            let byte = (v & 0x7F) as u8;
            v >>= 7;
            if v == 0 {
                self.info.data.push(byte);
                break;
            }
            self.info.data.push(byte | 0x80);
        }
    }
}
