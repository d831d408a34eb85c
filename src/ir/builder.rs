use super::*;

/// Incrementally builds a `Procedure`.
/// Blocks start out terminated by `ret` until `terminate` is called.
pub struct ProcedureBuilder {
    data: ProcedureData,
}

impl ProcedureBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            data: ProcedureData {
                name: name.to_owned(),
                module: String::new(),
                values: Vec::new(),
                blocks: Vec::new(),
            },
        }
    }

    pub fn set_module(&mut self, module: &str) {
        self.data.module = module.to_owned();
    }

    fn add_value(&mut self, name: Option<&str>, kind: ValueKind) -> ValueId {
        let id = ValueId(self.data.values.len() as u32);
        self.data.values.push(Value {
            name: name.map(str::to_owned),
            kind,
        });
        id
    }

    pub fn argument(&mut self, name: &str, ty: Type, attrs: ArgAttrs) -> ValueId {
        let index = self
            .data
            .values
            .iter()
            .filter(|v| matches!(v.kind, ValueKind::Argument(_)))
            .count();
        self.add_value(Some(name), ValueKind::Argument(Argument { index, ty, attrs }))
    }

    pub fn global(&mut self, name: &str, global: GlobalVariable) -> ValueId {
        self.add_value(Some(name), ValueKind::Global(global))
    }

    pub fn function(&mut self, name: &str, decl: FunctionDecl) -> ValueId {
        self.add_value(Some(name), ValueKind::Function(decl))
    }

    pub fn constant(&mut self, constant: Constant) -> ValueId {
        self.add_value(None, ValueKind::Constant(constant))
    }

    pub fn block(&mut self, name: &str) -> BlockId {
        let id = BlockId(self.data.blocks.len() as u32);
        self.data.blocks.push(Block {
            name: name.to_owned(),
            insts: Vec::new(),
            terminator: Terminator::Ret { value: None },
        });
        id
    }

    pub fn terminate(&mut self, block: BlockId, terminator: Terminator) {
        self.data.blocks[block.index()].terminator = terminator;
    }

    /// Append an instruction to the end of `block`.
    pub fn push(
        &mut self,
        block: BlockId,
        name: Option<&str>,
        ty: Type,
        kind: InstKind,
    ) -> ValueId {
        let id = self.add_value(name, ValueKind::Instruction(Instruction { block, ty, kind }));
        self.data.blocks[block.index()].insts.push(id);
        id
    }

    pub fn alloca(&mut self, block: BlockId, name: &str) -> ValueId {
        self.push(
            block,
            Some(name),
            Type::Ptr,
            InstKind::Alloca {
                allocated_type: None,
            },
        )
    }

    pub fn load(&mut self, block: BlockId, ptr: ValueId) -> ValueId {
        self.push(block, None, Type::Int, InstKind::Load { ptr, size: None })
    }

    pub fn store(&mut self, block: BlockId, value: ValueId, ptr: ValueId) -> ValueId {
        self.push(
            block,
            None,
            Type::Void,
            InstKind::Store {
                value,
                ptr,
                size: None,
            },
        )
    }

    pub fn gep(&mut self, block: BlockId, base: ValueId, inbounds: bool) -> ValueId {
        self.push(block, None, Type::Ptr, InstKind::Gep { base, inbounds })
    }

    pub fn call(&mut self, block: BlockId, callee: ValueId, args: &[ValueId], ty: Type) -> ValueId {
        self.push(
            block,
            None,
            ty,
            InstKind::Call {
                callee,
                args: args.to_vec(),
            },
        )
    }

    pub fn finish(self) -> Procedure {
        Procedure::from(self.data)
    }
}
