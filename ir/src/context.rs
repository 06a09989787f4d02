/// Per-compilation counters.
///
/// AST annotation ids and reduction ids must be unique within one
/// compilation; the context owns both so that independent compilations never
/// share hidden state.
#[derive(Debug, Clone, Default)]
pub struct CompileContext {
    next_ast_node: usize,
    next_reduce: usize,
}

impl CompileContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next AST annotation id, `__node_<n>`.
    pub fn next_ast_node_id(&mut self) -> String {
        let id = format!("__node_{}", self.next_ast_node);
        self.next_ast_node += 1;
        id
    }

    pub fn next_reduce_id(&mut self) -> usize {
        let id = self.next_reduce;
        self.next_reduce += 1;
        id
    }
}
