//! Recognize allocation, free and other library functions by their symbol names.
//! A symbol counts only if the declaration is also a recognized library function.
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;

use crate::ir::{AllocFnKind, FunctionDecl, Procedure, ValueId};

static FREE_FN_NAMES: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "_ZdlPv",
        "_ZdaPv",
        "_ZdlPvj",
        "_ZdlPvm",
        "_ZdlPvRKSt9nothrow_t",
        "_ZdlPvSt11align_val_t",
        "_ZdaPvj",
        "_ZdaPvm",
        "_ZdaPvRKSt9nothrow_t",
        "_ZdaPvSt11align_val_t",
        "_ZdlPvSt11align_val_tRKSt9nothrow_t",
        "_ZdaPvSt11align_val_tRKSt9nothrow_t",
        "_ZdlPvjSt11align_val_t",
        "_ZdlPvmSt11align_val_t",
        "_ZdaPvjSt11align_val_t",
        "_ZdaPvmSt11align_val_t",
        "??3@YAXPAX@Z",
        "??3@YAXPAXABUnothrow_t@std@@@Z",
        "??3@YAXPAXI@Z",
        "??3@YAXPEAX@Z",
        "??3@YAXPEAXAEBUnothrow_t@std@@@Z",
        "??3@YAXPEAX_K@Z",
        "??_V@YAXPAX@Z",
        "??_V@YAXPAXABUnothrow_t@std@@@Z",
        "??_V@YAXPAXI@Z",
        "??_V@YAXPEAX@Z",
        "??_V@YAXPEAXAEBUnothrow_t@std@@@Z",
        "??_V@YAXPEAX_K@Z",
        "__kmpc_free_shared",
    ]
    .into_iter()
    .collect()
});

static ALLOC_FN_NAMES: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "_Znwj",
        "_ZnwjRKSt9nothrow_t",
        "_ZnwjSt11align_val_t",
        "_ZnwjSt11align_val_tRKSt9nothrow_t",
        "_Znwm",
        "_ZnwmRKSt9nothrow_t",
        "_ZnwmSt11align_val_t",
        "_ZnwmSt11align_val_tRKSt9nothrow_t",
        "_Znaj",
        "_ZnajRKSt9nothrow_t",
        "_ZnajSt11align_val_t",
        "_ZnajSt11align_val_tRKSt9nothrow_t",
        "_Znam",
        "_ZnamRKSt9nothrow_t",
        "_ZnamSt11align_val_t",
        "_ZnamSt11align_val_tRKSt9nothrow_t",
        "??2@YAPAXI@Z",
        "??2@YAPAXIABUnothrow_t@std@@@Z",
        "??2@YAPEAX_K@Z",
        "??2@YAPEAX_KAEBUnothrow_t@std@@@Z",
        "??_U@YAPAXI@Z",
        "??_U@YAPAXIABUnothrow_t@std@@@Z",
        "??_U@YAPEAX_K@Z",
        "??_U@YAPEAX_KAEBUnothrow_t@std@@@Z",
        "strdup",
        "dunder_strdup",
        "strndup",
        "dunder_strndup",
        "__kmpc_alloc_shared",
        "posix_memalign",
    ]
    .into_iter()
    .collect()
});

// Calls inserted by instrumentation runtimes.
static INSTRUMENTATION_FN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^__(csi|csan|cilksan)").unwrap());

static TERMINATION_FN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(exit|abort|__clang_call_terminate|__assert_fail)$").unwrap());

fn callee(procedure: &Procedure, call: ValueId) -> Option<(&str, &FunctionDecl)> {
    procedure
        .called_function(call)
        .map(|(callee, decl)| (procedure.value_name(callee).unwrap_or(""), decl))
}

/// Calls to `malloc`-like functions, including reallocation.
pub fn is_alloc_fn(procedure: &Procedure, call: ValueId) -> bool {
    match callee(procedure, call) {
        Some((_, decl))
            if matches!(decl.alloc, Some(AllocFnKind::Alloc) | Some(AllocFnKind::Realloc)) =>
        {
            true
        }
        Some((name, decl)) => decl.library && ALLOC_FN_NAMES.contains(name),
        None => false,
    }
}

pub fn is_realloc_fn(procedure: &Procedure, call: ValueId) -> bool {
    callee(procedure, call).map_or(false, |(_, decl)| decl.alloc == Some(AllocFnKind::Realloc))
}

/// Calls to `free`-like functions.
pub fn is_free_fn(procedure: &Procedure, call: ValueId) -> bool {
    match callee(procedure, call) {
        Some((_, decl)) if decl.alloc == Some(AllocFnKind::Free) => true,
        Some((name, decl)) => decl.library && FREE_FN_NAMES.contains(name),
        None => false,
    }
}

pub fn is_instrumentation_fn(name: &str) -> bool {
    INSTRUMENTATION_FN.is_match(name)
}

pub fn is_termination_fn(name: &str) -> bool {
    TERMINATION_FN.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ProcedureBuilder, Type};

    #[test]
    fn test_fn_name_regex() {
        assert!(is_instrumentation_fn("__csi_before_load"));
        assert!(is_instrumentation_fn("__cilksan_enable_checking"));
        assert!(!is_instrumentation_fn("csi_helper"));
        assert!(is_termination_fn("abort"));
        assert!(!is_termination_fn("exit_group"));
    }

    #[test]
    fn test_alloc_and_free_calls() {
        let mut builder = ProcedureBuilder::new("f");
        let entry = builder.block("entry");
        let lib = |alloc| FunctionDecl {
            library: true,
            alloc,
            ..FunctionDecl::default()
        };
        let new = builder.function("_Znwm", lib(None));
        let delete = builder.function("_ZdlPv", lib(None));
        let realloc = builder.function("realloc", lib(Some(AllocFnKind::Realloc)));
        // Not a library function, so the name alone does not count.
        let fake = builder.function("strdup", FunctionDecl::default());
        let size = builder.constant(crate::ir::Constant::Int(4));
        let p = builder.call(entry, new, &[size], Type::Ptr);
        let d = builder.call(entry, delete, &[p], Type::Void);
        let r = builder.call(entry, realloc, &[p, size], Type::Ptr);
        let s = builder.call(entry, fake, &[p], Type::Ptr);
        let procedure = builder.finish();

        assert!(is_alloc_fn(&procedure, p));
        assert!(!is_realloc_fn(&procedure, p));
        assert!(is_free_fn(&procedure, d));
        assert!(!is_alloc_fn(&procedure, d));
        assert!(is_alloc_fn(&procedure, r));
        assert!(is_realloc_fn(&procedure, r));
        assert!(!is_alloc_fn(&procedure, s));
    }
}
