//! # Runtime ABI
//!
//! The fixed set of runtime entry points the low lowering emits calls to.
//! Every symbol takes and returns pointer-sized words; the table here is the
//! contract with the runtime library, not something the backend interprets.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeFn {
    // Allocation and barriers.
    GcAlloc,
    GcWriteBarrier,
    ArrayNew,
    HashNew,
    HashLen,
    HashGet,
    HashSet,
    RangeNew,
    StringNew,
    StringConcat,
    StringEquals,
    StringFromInt,
    StringFromDouble,
    StringFromBool,
    ObjectToString,
    // Exceptions.
    Throw,
    Rethrow,
    // Dispatch support.
    IsInstance,
    MethodLookup,
    // Async runtime.
    FutureNew,
    FutureRegisterContinuation,
    FutureComplete,
    FutureFail,
    FutureValue,
    // Channels and threads.
    ChannelNew,
    ChannelSend,
    ChannelReceive,
    ThreadSpawn,
    // FFI.
    FfiLoadLibrary,
    FfiResolve,
    // Reflection.
    ReflectFields,
    ReflectGet,
    // Console.
    IoPrint,
    IoPrintln,
    // JSON support for serializable classes.
    JsonParse,
    JsonHas,
    JsonGetInt,
    JsonGetDouble,
    JsonGetBool,
    JsonGetString,
    JsonEscape,
}

impl RuntimeFn {
    /// Link-level symbol name.
    pub fn symbol(self) -> &'static str {
        match self {
            RuntimeFn::GcAlloc => "gc_alloc",
            RuntimeFn::GcWriteBarrier => "gc_write_barrier",
            RuntimeFn::ArrayNew => "array_new",
            RuntimeFn::HashNew => "hash_new",
            RuntimeFn::HashLen => "hash_len",
            RuntimeFn::HashGet => "hash_get",
            RuntimeFn::HashSet => "hash_set",
            RuntimeFn::RangeNew => "range_new",
            RuntimeFn::StringNew => "string_new",
            RuntimeFn::StringConcat => "string_concat",
            RuntimeFn::StringEquals => "string_equals",
            RuntimeFn::StringFromInt => "string_from_int",
            RuntimeFn::StringFromDouble => "string_from_double",
            RuntimeFn::StringFromBool => "string_from_bool",
            RuntimeFn::ObjectToString => "object_to_string",
            RuntimeFn::Throw => "throw",
            RuntimeFn::Rethrow => "rethrow",
            RuntimeFn::IsInstance => "is_instance",
            RuntimeFn::MethodLookup => "method_lookup",
            RuntimeFn::FutureNew => "future_new",
            RuntimeFn::FutureRegisterContinuation => "future_register_continuation",
            RuntimeFn::FutureComplete => "future_complete",
            RuntimeFn::FutureFail => "future_fail",
            RuntimeFn::FutureValue => "future_value",
            RuntimeFn::ChannelNew => "channel_new",
            RuntimeFn::ChannelSend => "channel_send",
            RuntimeFn::ChannelReceive => "channel_receive",
            RuntimeFn::ThreadSpawn => "thread_spawn",
            RuntimeFn::FfiLoadLibrary => "ffi_load_library",
            RuntimeFn::FfiResolve => "ffi_resolve",
            RuntimeFn::ReflectFields => "reflect_fields",
            RuntimeFn::ReflectGet => "reflect_get",
            RuntimeFn::IoPrint => "io_print",
            RuntimeFn::IoPrintln => "io_println",
            RuntimeFn::JsonParse => "json_parse",
            RuntimeFn::JsonHas => "json_has",
            RuntimeFn::JsonGetInt => "json_get_int",
            RuntimeFn::JsonGetDouble => "json_get_double",
            RuntimeFn::JsonGetBool => "json_get_bool",
            RuntimeFn::JsonGetString => "json_get_string",
            RuntimeFn::JsonEscape => "json_escape",
        }
    }
}

impl crate::anvil::Intrinsic {
    /// The runtime entry point an intrinsic lowers to.
    pub fn runtime_fn(self) -> RuntimeFn {
        use crate::anvil::Intrinsic::*;
        match self {
            Print => RuntimeFn::IoPrint,
            Println => RuntimeFn::IoPrintln,
            ObjectToString => RuntimeFn::ObjectToString,
            IntToString => RuntimeFn::StringFromInt,
            DoubleToString => RuntimeFn::StringFromDouble,
            BoolToString => RuntimeFn::StringFromBool,
            StringEquals => RuntimeFn::StringEquals,
            ChannelNew => RuntimeFn::ChannelNew,
            ChannelSend => RuntimeFn::ChannelSend,
            ChannelReceive => RuntimeFn::ChannelReceive,
            FutureNew => RuntimeFn::FutureNew,
            FutureComplete => RuntimeFn::FutureComplete,
            FutureFail => RuntimeFn::FutureFail,
            FutureValue => RuntimeFn::FutureValue,
            ThreadSpawn => RuntimeFn::ThreadSpawn,
            ReflectFields => RuntimeFn::ReflectFields,
            ReflectGet => RuntimeFn::ReflectGet,
            JsonParse => RuntimeFn::JsonParse,
            JsonHas => RuntimeFn::JsonHas,
            JsonGetInt => RuntimeFn::JsonGetInt,
            JsonGetDouble => RuntimeFn::JsonGetDouble,
            JsonGetBool => RuntimeFn::JsonGetBool,
            JsonGetString => RuntimeFn::JsonGetString,
            JsonEscape => RuntimeFn::JsonEscape,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols_match_the_abi_table() {
        assert_eq!(RuntimeFn::GcAlloc.symbol(), "gc_alloc");
        assert_eq!(RuntimeFn::GcWriteBarrier.symbol(), "gc_write_barrier");
        assert_eq!(RuntimeFn::Throw.symbol(), "throw");
        assert_eq!(RuntimeFn::Rethrow.symbol(), "rethrow");
        assert_eq!(
            RuntimeFn::FutureRegisterContinuation.symbol(),
            "future_register_continuation"
        );
        assert_eq!(RuntimeFn::ChannelReceive.symbol(), "channel_receive");
        assert_eq!(RuntimeFn::FfiLoadLibrary.symbol(), "ffi_load_library");
        assert_eq!(RuntimeFn::ReflectFields.symbol(), "reflect_fields");
    }
}
