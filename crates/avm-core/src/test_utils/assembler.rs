//! Builders for hand-assembled contract modules.

use alloy_primitives::{Address, Bytes};

use crate::{
    bytecode::opcode::*,
    builtins::{BLOCKCHAIN, OBJECT},
    AccessFlags, ClassFile, ConstantPool, ContractModule, ExceptionHandler, FieldInfo, FieldRef,
    MethodInfo, MethodOwner, MethodRef, PoolEntry,
};

/// A position in method code, bound with [`CodeBuilder::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
struct Fixup {
    opcode_at: usize,
    operand_at: usize,
    label: Label,
    wide: bool,
}

/// Emits the code of one method.
///
/// Branch targets are labels; they are patched when the method is finished.
#[derive(Debug)]
pub struct CodeBuilder<'a> {
    pool: &'a mut ConstantPool,
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    handlers: Vec<(Label, Label, Label, u16)>,
}

impl<'a> CodeBuilder<'a> {
    fn new(pool: &'a mut ConstantPool) -> Self {
        Self {
            pool,
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// The current byte offset.
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    /// Emits a bare opcode.
    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.code.push(opcode);
        self
    }

    /// Emits several bare opcodes.
    pub fn ops(&mut self, opcodes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(opcodes);
        self
    }

    /// Emits raw bytes, operands included.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    /// Emits `count` no-ops.
    pub fn nops(&mut self, count: usize) -> &mut Self {
        self.code.resize(self.code.len() + count, NOP);
        self
    }

    fn u16(&mut self, value: u16) -> &mut Self {
        self.code.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Pushes an `int` with the shortest encoding.
    pub fn iconst(&mut self, value: i32) -> &mut Self {
        match value {
            -1..=5 => self.op((ICONST_0 as i32 + value) as u8),
            -128..=127 => self.op(BIPUSH).raw(&[value as i8 as u8]),
            -32_768..=32_767 => self.op(SIPUSH).raw(&(value as i16).to_be_bytes()),
            _ => {
                let index = self.pool.intern(PoolEntry::Int(value));
                self.op(LDC_W).u16(index)
            }
        }
    }

    /// Pushes a `long`.
    pub fn lconst(&mut self, value: i64) -> &mut Self {
        match value {
            0 => self.op(LCONST_0),
            1 => self.op(LCONST_1),
            _ => {
                let index = self.pool.intern(PoolEntry::Long(value));
                self.op(LDC2_W).u16(index)
            }
        }
    }

    /// Pushes a `float` from the pool.
    pub fn fconst(&mut self, value: f32) -> &mut Self {
        let index = self.pool.intern(PoolEntry::Float(value));
        self.op(LDC_W).u16(index)
    }

    /// Pushes a `double` from the pool.
    pub fn dconst(&mut self, value: f64) -> &mut Self {
        let index = self.pool.intern(PoolEntry::Double(value));
        self.op(LDC2_W).u16(index)
    }

    fn local(&mut self, opcode: u8, index: u16) -> &mut Self {
        match u8::try_from(index) {
            Ok(index) => self.op(opcode).raw(&[index]),
            Err(_) => self.op(WIDE).op(opcode).u16(index),
        }
    }

    /// Loads an `int` local.
    pub fn iload(&mut self, index: u16) -> &mut Self {
        self.local(ILOAD, index)
    }

    /// Stores an `int` local.
    pub fn istore(&mut self, index: u16) -> &mut Self {
        self.local(ISTORE, index)
    }

    /// Loads a `long` local.
    pub fn lload(&mut self, index: u16) -> &mut Self {
        self.local(LLOAD, index)
    }

    /// Stores a `long` local.
    pub fn lstore(&mut self, index: u16) -> &mut Self {
        self.local(LSTORE, index)
    }

    /// Loads a `double` local.
    pub fn dload(&mut self, index: u16) -> &mut Self {
        self.local(DLOAD, index)
    }

    /// Stores a `double` local.
    pub fn dstore(&mut self, index: u16) -> &mut Self {
        self.local(DSTORE, index)
    }

    /// Loads a reference local.
    pub fn aload(&mut self, index: u16) -> &mut Self {
        self.local(ALOAD, index)
    }

    /// Stores a reference local.
    pub fn astore(&mut self, index: u16) -> &mut Self {
        self.local(ASTORE, index)
    }

    /// Adds a constant to an `int` local.
    pub fn iinc(&mut self, index: u16, delta: i16) -> &mut Self {
        match (u8::try_from(index), i8::try_from(delta)) {
            (Ok(index), Ok(delta)) => self.op(IINC).raw(&[index, delta as u8]),
            _ => self.op(WIDE).op(IINC).u16(index).raw(&delta.to_be_bytes()),
        }
    }

    fn class_ref(&mut self, class: &str) -> u16 {
        self.pool.intern(PoolEntry::Class(class.to_owned()))
    }

    fn field(&mut self, opcode: u8, class: &str, name: &str, descriptor: &str) -> &mut Self {
        let class = self.class_ref(class);
        let index = self.pool.intern(PoolEntry::Field(FieldRef {
            class,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
        }));
        self.op(opcode).u16(index)
    }

    /// Reads a static field.
    pub fn getstatic(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        self.field(GETSTATIC, class, name, descriptor)
    }

    /// Writes a static field.
    pub fn putstatic(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        self.field(PUTSTATIC, class, name, descriptor)
    }

    /// Reads an instance field.
    pub fn getfield(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        self.field(GETFIELD, class, name, descriptor)
    }

    /// Writes an instance field.
    pub fn putfield(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        self.field(PUTFIELD, class, name, descriptor)
    }

    fn invoke(
        &mut self,
        opcode: u8,
        owner: MethodOwner,
        name: &str,
        descriptor: &str,
    ) -> &mut Self {
        let index = self.pool.intern(PoolEntry::Method(MethodRef {
            owner,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
        }));
        self.op(opcode).u16(index)
    }

    /// Calls a static method.
    pub fn invokestatic(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        let owner = MethodOwner::Class(self.class_ref(class));
        self.invoke(INVOKESTATIC, owner, name, descriptor)
    }

    /// Calls an instance method through dynamic dispatch.
    pub fn invokevirtual(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        let owner = MethodOwner::Class(self.class_ref(class));
        self.invoke(INVOKEVIRTUAL, owner, name, descriptor)
    }

    /// Calls an instance method without dynamic dispatch.
    pub fn invokespecial(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        let owner = MethodOwner::Class(self.class_ref(class));
        self.invoke(INVOKESPECIAL, owner, name, descriptor)
    }

    /// Calls a host native.
    pub fn native(&mut self, name: &str, descriptor: &str) -> &mut Self {
        self.invokestatic(BLOCKCHAIN, name, descriptor)
    }

    /// Calls an entry point of another contract.
    pub fn invoke_contract(&mut self, address: Address, name: &str, descriptor: &str) -> &mut Self {
        self.invoke(INVOKESTATIC, MethodOwner::Contract(address), name, descriptor)
    }

    /// Allocates an instance and runs its no-argument constructor, leaving it on the stack.
    pub fn construct(&mut self, class: &str) -> &mut Self {
        self.new_object(class).op(DUP).invokespecial(class, "<init>", "()V")
    }

    /// Allocates an uninitialized instance.
    pub fn new_object(&mut self, class: &str) -> &mut Self {
        let index = self.class_ref(class);
        self.op(NEW).u16(index)
    }

    /// Allocates a primitive array of the length on the stack.
    pub fn newarray(&mut self, atype: u8) -> &mut Self {
        self.op(NEWARRAY).raw(&[atype])
    }

    /// Allocates a reference array of the length on the stack.
    pub fn anewarray(&mut self, class: &str) -> &mut Self {
        let index = self.class_ref(class);
        self.op(ANEWARRAY).u16(index)
    }

    /// Checks a cast.
    pub fn checkcast(&mut self, class: &str) -> &mut Self {
        let index = self.class_ref(class);
        self.op(CHECKCAST).u16(index)
    }

    /// Tests a type.
    pub fn instanceof(&mut self, class: &str) -> &mut Self {
        let index = self.class_ref(class);
        self.op(INSTANCEOF).u16(index)
    }

    /// Creates an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the current position.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    /// Creates a label bound to the current position.
    pub fn here(&mut self) -> Label {
        let label = self.label();
        self.bind(label);
        label
    }

    /// Emits a branch with a 16-bit offset to `label`.
    pub fn branch(&mut self, opcode: u8, label: Label) -> &mut Self {
        let opcode_at = self.code.len();
        self.fixups.push(Fixup { opcode_at, operand_at: opcode_at + 1, label, wide: false });
        self.op(opcode).u16(0)
    }

    /// Emits a `goto_w` to `label`.
    pub fn goto_w(&mut self, label: Label) -> &mut Self {
        let opcode_at = self.code.len();
        self.fixups.push(Fixup { opcode_at, operand_at: opcode_at + 1, label, wide: true });
        self.op(GOTO_W).raw(&[0; 4])
    }

    /// Registers a handler for `[start, end)`; `catch_type` `None` catches everything.
    pub fn try_catch(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> &mut Self {
        let catch_type = catch_type.map_or(0, |class| self.class_ref(class));
        self.handlers.push((start, end, handler, catch_type));
        self
    }

    fn resolve(&self, label: Label) -> usize {
        self.labels[label.0].unwrap_or_else(|| panic!("label {} never bound", label.0))
    }

    fn finish(mut self) -> (Bytes, Vec<ExceptionHandler>) {
        for i in 0..self.fixups.len() {
            let Fixup { opcode_at, operand_at, label, wide } = self.fixups[i];
            let offset = self.resolve(label) as i64 - opcode_at as i64;
            if wide {
                let bytes = (offset as i32).to_be_bytes();
                self.code[operand_at..operand_at + 4].copy_from_slice(&bytes);
            } else {
                let offset = i16::try_from(offset).expect("branch offset fits in 16 bits");
                self.code[operand_at..operand_at + 2].copy_from_slice(&offset.to_be_bytes());
            }
        }
        let handlers = self
            .handlers
            .iter()
            .map(|&(start, end, handler, catch_type)| ExceptionHandler {
                start_pc: self.resolve(start) as u16,
                end_pc: self.resolve(end) as u16,
                handler_pc: self.resolve(handler) as u16,
                catch_type,
            })
            .collect();
        (Bytes::from(self.code), handlers)
    }
}

/// Builds one class of a module.
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    class: ClassFile,
}

impl ClassBuilder {
    /// A public class extending the universal base.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            class: ClassFile {
                name: name.into(),
                super_name: None,
                access: AccessFlags::PUBLIC,
                pool: ConstantPool::new(),
                fields: Vec::new(),
                methods: Vec::new(),
            },
        }
    }

    /// Sets the superclass.
    pub fn extends(mut self, super_name: impl Into<String>) -> Self {
        self.class.super_name = Some(super_name.into());
        self
    }

    /// Adds a field with explicit flags.
    pub fn field_with(
        mut self,
        access: AccessFlags,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        self.class.fields.push(FieldInfo {
            access,
            name: name.into(),
            descriptor: descriptor.into(),
        });
        self
    }

    /// Adds an instance field.
    pub fn field(self, name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        self.field_with(AccessFlags::PUBLIC, name, descriptor)
    }

    /// Adds a static field.
    pub fn static_field(self, name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        self.field_with(AccessFlags::PUBLIC | AccessFlags::STATIC, name, descriptor)
    }

    /// Adds a method whose code is emitted by `emit`.
    pub fn method_with(
        mut self,
        access: AccessFlags,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        emit: impl FnOnce(&mut CodeBuilder<'_>),
    ) -> Self {
        let mut code = CodeBuilder::new(&mut self.class.pool);
        emit(&mut code);
        let (code, handlers) = code.finish();
        self.class.methods.push(MethodInfo {
            access,
            name: name.into(),
            descriptor: descriptor.into(),
            code,
            handlers,
        });
        self
    }

    /// Adds a public static method.
    pub fn static_method(
        self,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        emit: impl FnOnce(&mut CodeBuilder<'_>),
    ) -> Self {
        self.method_with(AccessFlags::PUBLIC | AccessFlags::STATIC, name, descriptor, emit)
    }

    /// Adds a public instance method.
    pub fn method(
        self,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        emit: impl FnOnce(&mut CodeBuilder<'_>),
    ) -> Self {
        self.method_with(AccessFlags::PUBLIC, name, descriptor, emit)
    }

    /// Adds an abstract method without code.
    pub fn abstract_method(self, name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        self.method_with(AccessFlags::PUBLIC | AccessFlags::ABSTRACT, name, descriptor, |_| {})
    }

    /// Adds a static initializer.
    pub fn clinit(self, emit: impl FnOnce(&mut CodeBuilder<'_>)) -> Self {
        self.method_with(AccessFlags::STATIC, "<clinit>", "()V", emit)
    }

    /// Adds a no-argument constructor chaining to the superclass constructor.
    pub fn default_constructor(self) -> Self {
        let parent = self.class.super_name.clone().unwrap_or_else(|| OBJECT.to_owned());
        self.method("<init>", "()V", |code| {
            code.aload(0).invokespecial(&parent, "<init>", "()V").op(RETURN);
        })
    }

    /// The class name.
    pub fn name(&self) -> &str {
        &self.class.name
    }

    /// Finishes the class.
    pub fn build(self) -> ClassFile {
        self.class
    }
}

/// Builds a contract module.
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    module: ContractModule,
}

impl ModuleBuilder {
    /// A module whose entry points live in `main_class`.
    pub fn new(main_class: impl Into<String>) -> Self {
        Self { module: ContractModule { main_class: main_class.into(), classes: Vec::new() } }
    }

    /// Adds a class.
    pub fn class(mut self, class: ClassBuilder) -> Self {
        self.module.classes.push(class.build());
        self
    }

    /// Finishes the module.
    pub fn build(self) -> ContractModule {
        self.module
    }

    /// Finishes and encodes the module.
    pub fn encode(self) -> Bytes {
        self.module.encode()
    }
}
