//! Runtime error taxonomy.
//!
//! `RuntimeError` covers every fault an opcode or runtime routine can raise
//! (§7's seven semantic kinds); subsystem-local errors (`GcError`,
//! `JitError`, `SchedulerError`) convert into it at the boundary where they
//! cross back into interpreter control flow.

use miette::Diagnostic;
use thiserror::Error;

/// The seven semantic fault categories. Distinct from `RuntimeError`'s
/// variants so hosts (the debugger hook, test assertions) can match on
/// category without enumerating every concrete cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ArithmeticFault,
    TypeMismatch,
    LookupFailure,
    AccessViolation,
    CapacityFault,
    ContractViolation,
    UnhandledException,
}

#[derive(Debug, Error, Diagnostic)]
pub enum RuntimeError {
    #[error("division by zero")]
    #[diagnostic(code(vsr::arith::div_by_zero))]
    DivisionByZero,

    #[error("modulo by zero")]
    #[diagnostic(code(vsr::arith::mod_by_zero))]
    ModuloByZero,

    #[error("cannot cast value of type '{from}' to '{to}'")]
    #[diagnostic(code(vsr::arith::bad_cast))]
    BadCast { from: String, to: String },

    #[error("operand of type '{found}' is not valid for this operation (expected {expected})")]
    #[diagnostic(code(vsr::type::mismatch))]
    TypeMismatch { expected: String, found: String },

    #[error("channel element type mismatch: expected '{expected}', got '{found}'")]
    #[diagnostic(code(vsr::type::channel_mismatch))]
    ChannelTypeMismatch { expected: String, found: String },

    #[error("undefined class '{name}'")]
    #[diagnostic(code(vsr::lookup::class))]
    UndefinedClass { name: String },

    #[error("no method '{name}' on class '{class}' accepting {argc} argument(s)")]
    #[diagnostic(code(vsr::lookup::method))]
    UndefinedMethod {
        class: String,
        name: String,
        argc: usize,
    },

    #[error("undefined field '{name}' on class '{class}'")]
    #[diagnostic(code(vsr::lookup::field))]
    UndefinedField { class: String, name: String },

    #[error("unknown import path '{path}'")]
    #[diagnostic(code(vsr::lookup::import))]
    UnknownImport { path: String },

    #[error("cannot access {visibility} member '{member}' of '{class}' from this context")]
    #[diagnostic(code(vsr::access::violation))]
    AccessViolation {
        class: String,
        member: String,
        visibility: &'static str,
    },

    #[error("operand stack overflow (capacity {capacity})")]
    #[diagnostic(code(vsr::capacity::stack))]
    StackOverflow { capacity: usize },

    #[error("call stack overflow (depth {depth})")]
    #[diagnostic(code(vsr::capacity::call_stack))]
    CallStackOverflow { depth: usize },

    #[error("task count exceeded limit of {limit}")]
    #[diagnostic(code(vsr::capacity::tasks))]
    TaskLimitExceeded { limit: usize },

    #[error("'{name}' requires at least {min} argument(s), got {got}")]
    #[diagnostic(code(vsr::contract::arity_low))]
    ArityBelowMinimum { name: String, min: usize, got: usize },

    #[error("'{name}' accepts at most {max} argument(s), got {got}")]
    #[diagnostic(code(vsr::contract::arity_high))]
    ArityAboveMaximum { name: String, max: usize, got: usize },

    #[error("cannot instantiate abstract class '{name}'")]
    #[diagnostic(code(vsr::contract::abstract_instantiation))]
    AbstractInstantiation { name: String },

    #[error("class '{class}' does not implement '{method}' required by interface '{iface}'")]
    #[diagnostic(code(vsr::contract::missing_interface_method))]
    MissingInterfaceMethod {
        class: String,
        iface: String,
        method: String,
    },

    #[error("unhandled exception: {class_name}")]
    #[diagnostic(code(vsr::exception::unhandled))]
    UnhandledException { class_name: String },

    #[error("corrupt bytecode: {detail}")]
    #[diagnostic(code(vsr::vm::corrupt_bytecode))]
    CorruptBytecode { detail: String },

    #[error("value '{name}' is not callable")]
    #[diagnostic(code(vsr::type::not_callable))]
    NotCallable { name: String },
}

impl RuntimeError {
    /// Name of the builtin exception class (registered by
    /// `Registry::register_builtin_exceptions`) that represents this fault as
    /// a first-class `Object` when it unwinds the frame stack.
    pub fn exception_class_name(&self) -> &'static str {
        use RuntimeError::*;
        match self {
            DivisionByZero => "DivisionByZero",
            ModuloByZero => "ModuloByZero",
            BadCast { .. } => "BadCast",
            TypeMismatch { .. } => "TypeMismatch",
            ChannelTypeMismatch { .. } => "ChannelTypeMismatch",
            UndefinedClass { .. } => "UndefinedClass",
            UndefinedMethod { .. } => "UndefinedMethod",
            UndefinedField { .. } => "UndefinedField",
            UnknownImport { .. } => "UnknownImport",
            AccessViolation { .. } => "AccessViolation",
            StackOverflow { .. } => "StackOverflow",
            CallStackOverflow { .. } => "CallStackOverflow",
            TaskLimitExceeded { .. } => "TaskLimitExceeded",
            ArityBelowMinimum { .. } => "ArityBelowMinimum",
            ArityAboveMaximum { .. } => "ArityAboveMaximum",
            AbstractInstantiation { .. } => "AbstractInstantiation",
            MissingInterfaceMethod { .. } => "MissingInterfaceMethod",
            UnhandledException { .. } => "UnhandledException",
            CorruptBytecode { .. } => "CorruptBytecode",
            NotCallable { .. } => "NotCallable",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        use RuntimeError::*;
        match self {
            DivisionByZero | ModuloByZero | BadCast { .. } => ErrorKind::ArithmeticFault,
            TypeMismatch { .. } | ChannelTypeMismatch { .. } | NotCallable { .. } => {
                ErrorKind::TypeMismatch
            }
            UndefinedClass { .. }
            | UndefinedMethod { .. }
            | UndefinedField { .. }
            | UnknownImport { .. } => ErrorKind::LookupFailure,
            AccessViolation { .. } => ErrorKind::AccessViolation,
            StackOverflow { .. } | CallStackOverflow { .. } | TaskLimitExceeded { .. } => {
                ErrorKind::CapacityFault
            }
            ArityBelowMinimum { .. }
            | ArityAboveMaximum { .. }
            | AbstractInstantiation { .. }
            | MissingInterfaceMethod { .. } => ErrorKind::ContractViolation,
            UnhandledException { .. } => ErrorKind::UnhandledException,
            CorruptBytecode { .. } => ErrorKind::ArithmeticFault,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum GcError {
    #[error("heap corruption detected: {detail}")]
    #[diagnostic(code(vsr::gc::corruption))]
    Corruption { detail: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum JitError {
    #[error("relocation target for block {block_id} is missing")]
    #[diagnostic(code(vsr::jit::missing_relocation))]
    MissingRelocationTarget { block_id: u32 },

    #[error("unsupported IR instruction for target backend: {detail}")]
    #[diagnostic(code(vsr::jit::unsupported_instruction))]
    UnsupportedInstruction { detail: String },

    #[error("failed to map executable pages: {detail}")]
    #[diagnostic(code(vsr::jit::mmap_failed))]
    MmapFailed { detail: String },
}

impl From<JitError> for RuntimeError {
    fn from(e: JitError) -> Self {
        RuntimeError::CorruptBytecode {
            detail: e.to_string(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("stop-the-world wait timed out after {waited_ms}ms with {parked}/{total} workers parked")]
    #[diagnostic(code(vsr::scheduler::stw_timeout))]
    StwTimeout {
        waited_ms: u64,
        parked: usize,
        total: usize,
    },

    #[error("deadlock detected among tasks {cycle:?}")]
    #[diagnostic(code(vsr::scheduler::deadlock))]
    Deadlock { cycle: Vec<u64> },
}
