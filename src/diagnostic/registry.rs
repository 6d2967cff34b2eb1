/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    pub short: &'static str, // brief description for tooling
    pub long: &'static str,  // full explanation for --explain
}

/// Stable codes for builtin exceptions (`KRK-E`) and code-file load errors (`KRK-L`).
pub static REGISTRY: &[ErrorEntry] = &[
    // ── Exceptions ──────────────────────────────────────────────────────────
    ErrorEntry {
        code: "KRK-E001",
        short: "TypeError: operation applied to a value of the wrong type",
        long: r#"## KRK-E001: TypeError

An operator, call or attribute write was applied to a value whose type
does not support it: adding an `int` to a `list`, calling a value that is
not callable, subscripting an object without `__get__`, or writing a
special method into a class after it was finalized.

Check the types of the operands named in the message. Classes can opt in
to operators by defining `__add__`, `__eq__`, `__get__` and friends.
"#,
    },
    ErrorEntry {
        code: "KRK-E002",
        short: "ArgumentError: call arguments do not match the parameters",
        long: r#"## KRK-E002: ArgumentError

A function was called with too many positional arguments, without a
required argument, with a keyword it does not declare, or with two values
for the same parameter. Builtin functions also raise it outside their
accepted argument count, and a class without `__init__` raises it when
called with arguments.
"#,
    },
    ErrorEntry {
        code: "KRK-E003",
        short: "IndexError: sequence index out of range",
        long: r#"## KRK-E003: IndexError

A `list` or `str` was indexed past its end. Negative indices count from
the end, so the valid range for a sequence of length `n` is `-n..n`.
"#,
    },
    ErrorEntry {
        code: "KRK-E004",
        short: "KeyError: dict key not present",
        long: r#"## KRK-E004: KeyError

A `dict` lookup or deletion used a key the dict does not contain. Use
`key in d` (`__contains__`) to test first.
"#,
    },
    ErrorEntry {
        code: "KRK-E005",
        short: "AttributeError: attribute not found",
        long: r#"## KRK-E005: AttributeError

An attribute read found nothing in the instance fields, the class, or any
of its base classes. `super()` lookups start at the base class and raise
this when no ancestor defines the name.
"#,
    },
    ErrorEntry {
        code: "KRK-E006",
        short: "NameError: global name not defined",
        long: r#"## KRK-E006: NameError

A global was read, assigned or deleted that is defined neither in the
current module nor in `builtins`. Assignment to a global requires it to
exist already; definitions create it.
"#,
    },
    ErrorEntry {
        code: "KRK-E007",
        short: "ImportError: module not found or failed to load",
        long: r#"## KRK-E007: ImportError

`import name` found no registered native module and no `name.kbc.json`
file in any module search path, or the file it found could not be loaded.

Print the search path with `kuroko -M` and add directories with `-I`.
"#,
    },
    ErrorEntry {
        code: "KRK-E008",
        short: "OSError: host operation failed",
        long: r#"## KRK-E008: OSError

A host operation failed: writing program output, reading the clock, or
another call into the operating system.
"#,
    },
    ErrorEntry {
        code: "KRK-E009",
        short: "ValueError: value has the right type but is invalid",
        long: r#"## KRK-E009: ValueError

A conversion or operation received a value of an acceptable type that it
cannot use, such as `int("abc")`, a negative shift count, or a negative
sleep length.
"#,
    },
    ErrorEntry {
        code: "KRK-E010",
        short: "ZeroDivisionError: division or modulo by zero",
        long: r#"## KRK-E010: ZeroDivisionError

The right operand of `/` or `%` was zero. Integer division yields a
float, but a zero divisor is still an error.
"#,
    },
    ErrorEntry {
        code: "KRK-E011",
        short: "KeyboardInterrupt: execution interrupted",
        long: r#"## KRK-E011: KeyboardInterrupt

The interrupt flag was set (for example by Ctrl-C) and the VM raised this
exception at the next loop back-edge or call. It can be caught like any
other exception.
"#,
    },
    ErrorEntry {
        code: "KRK-E012",
        short: "RecursionError: call depth limit reached",
        long: r#"## KRK-E012: RecursionError

The number of active call frames reached the configured maximum (256 by
default). Usually a function calls itself without a base case.
"#,
    },
    ErrorEntry {
        code: "KRK-E013",
        short: "NotImplementedError: operation left unimplemented",
        long: r#"## KRK-E013: NotImplementedError

Raised by library code for operations a class declares but does not
provide.
"#,
    },
    ErrorEntry {
        code: "KRK-E014",
        short: "SystemError: internal VM error",
        long: r#"## KRK-E014: SystemError

The virtual machine met a malformed instruction stream: an unknown opcode,
a stack underflow, or a handler instruction with no active region. This
indicates a compiler bug, not a user error.
"#,
    },
    ErrorEntry {
        code: "KRK-E015",
        short: "MemoryError: result too large to allocate",
        long: r#"## KRK-E015: MemoryError

An operation would have built a value larger than the VM allows, such as
repeating a string a huge number of times. The limit is 1 GiB per string.
"#,
    },
    // ── Code files ──────────────────────────────────────────────────────────
    ErrorEntry {
        code: "KRK-L001",
        short: "code file could not be read",
        long: r#"## KRK-L001: code file could not be read

The path given on the command line does not exist or is not readable.
"#,
    },
    ErrorEntry {
        code: "KRK-L002",
        short: "code file is not valid JSON",
        long: r#"## KRK-L002: code file is not valid JSON

A compiled code file is a JSON document with a top-level `function`
object. The message gives the line and column where parsing failed.
"#,
    },
    ErrorEntry {
        code: "KRK-L003",
        short: "unknown opcode byte",
        long: r#"## KRK-L003: unknown opcode byte

A byte at an instruction boundary is not an opcode. The code file was
produced by an incompatible compiler or was corrupted.
"#,
    },
    ErrorEntry {
        code: "KRK-L004",
        short: "instruction truncated",
        long: r#"## KRK-L004: instruction truncated

The last instruction of a function is missing operand bytes or closure
capture descriptors.
"#,
    },
    ErrorEntry {
        code: "KRK-L005",
        short: "constant index out of range",
        long: r#"## KRK-L005: constant index out of range

An instruction refers to a constant past the end of its function's
constant pool.
"#,
    },
    ErrorEntry {
        code: "KRK-L006",
        short: "constant of the wrong kind",
        long: r#"## KRK-L006: constant of the wrong kind

`CLOSURE` needs a function constant; global, attribute, class, method and
import instructions need a string constant naming the target.
"#,
    },
    ErrorEntry {
        code: "KRK-L007",
        short: "jump target outside the code",
        long: r#"## KRK-L007: jump target outside the code

A jump, loop or handler instruction points before the start or past the
end of its function's code.
"#,
    },
];

/// Look up an error entry by code (e.g. `"KRK-E004"`).
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code == code)
}

/// Code of a builtin exception class, by name.
pub fn code_for_exception(type_name: &str) -> Option<&'static str> {
    let prefix = format!("{type_name}:");
    REGISTRY.iter().find(|e| e.code.starts_with("KRK-E") && e.short.starts_with(&prefix)).map(|e| e.code)
}
