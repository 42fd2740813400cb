//! Linker error types.
//!
//! Every failure the linker can report is a variant of [`LinkError`].
//! Symbol-resolution problems are accumulated and reported together in a
//! single error; parse, layout, relocation and entry-point failures abort
//! the link individually.

use std::fmt;

/// A pair of conflicting strong definitions for one symbol name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateDef {
    pub name: String,
    /// Object that provided the definition that was seen first.
    pub first: String,
    /// Object that provided the conflicting later definition.
    pub second: String,
}

/// A reference to a symbol that no input object defines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndefinedRef {
    pub name: String,
    /// Object whose relocation needs the symbol.
    pub referenced_by: String,
}

#[derive(Debug)]
pub enum LinkError {
    /// The input could not be parsed as a relocatable object file, or its
    /// contents are internally inconsistent.
    MalformedObject { name: String, reason: String },
    /// Two or more strong global definitions share a name. All conflicts
    /// found during resolution are listed.
    DuplicateSymbol(Vec<DuplicateDef>),
    /// References that no global definition and no local definition in the
    /// referencing object satisfies. All of them are listed.
    UndefinedSymbol(Vec<UndefinedRef>),
    /// The laid-out image would exceed the configured maximum size.
    LayoutOverflow { needed: u64, max: u64 },
    /// A computed relocation value does not fit the relocation's width.
    RelocationOverflow {
        object: String,
        symbol: String,
        offset: u64,
        value: i64,
        width: u32,
    },
    /// The requested entry symbol is unresolved or not in the code segment.
    MissingEntryPoint { name: String, reason: String },
}

pub type LinkResult<T> = Result<T, LinkError>;

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::MalformedObject { name, reason } => {
                write!(f, "malformed object {name}: {reason}")
            }
            LinkError::DuplicateSymbol(dups) => {
                writeln!(f, "duplicate symbol definitions:")?;
                for d in dups {
                    writeln!(
                        f,
                        "  `{}` defined in both {} and {}",
                        d.name, d.first, d.second
                    )?;
                }
                Ok(())
            }
            LinkError::UndefinedSymbol(refs) => {
                writeln!(f, "undefined symbols:")?;
                for r in refs {
                    writeln!(f, "  `{}` referenced by {}", r.name, r.referenced_by)?;
                }
                Ok(())
            }
            LinkError::LayoutOverflow { needed, max } => {
                write!(
                    f,
                    "image layout needs 0x{needed:x} bytes, exceeding the maximum of 0x{max:x}"
                )
            }
            LinkError::RelocationOverflow {
                object,
                symbol,
                offset,
                value,
                width,
            } => {
                write!(
                    f,
                    "relocation against `{symbol}` at offset 0x{offset:x} in {object}: \
                     value 0x{value:x} does not fit in {width} bits"
                )
            }
            LinkError::MissingEntryPoint { name, reason } => {
                write!(f, "entry point `{name}`: {reason}")
            }
        }
    }
}

impl std::error::Error for LinkError {}
