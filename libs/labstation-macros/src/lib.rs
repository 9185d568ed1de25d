//! Derive macros materializing the `Option`/`Status` meta-descriptors
//! as per-instance data. Field-level attributes
//! (`#[option(...)]`, `#[status(...)]`) declare the class-level metadata;
//! the derived `impl` wires it into [`labstation_core::meta::OptionsSet`] /
//! [`labstation_core::meta::StatusSet`].
//!
//! One `expand_*` function per macro, living in its own module, dispatched
//! from a thin `lib.rs`.

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod options;
mod status;

/// Derives [`labstation_core::meta::OptionsSet`] for a struct whose fields
/// are each one declared `Option`. Field attributes:
///
/// - `#[option(default = <expr>)]` — value used when the config omits this
///   option; absence of this attribute means the option is required.
/// - `#[option(missing = "silent" | "info" | "warn" | "error")]` — log level
///   when the default applies (default: `silent`).
/// - `#[option(checker = "path::to::fn")]` — `fn(&serde_json::Value) -> bool`
///   run after construction; failure aborts activation.
/// - `#[option(constructor = "path::to::fn")]` — `fn(serde_json::Value) ->
///   Result<serde_json::Value, String>` run before the checker.
///
/// # Panics
/// Never panics; malformed input is reported as a compile error via
/// `syn::Error::to_compile_error`, not a panic.
#[proc_macro_derive(Options, attributes(option))]
pub fn derive_options(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    options::expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Derives [`labstation_core::meta::StatusSet`] for a struct whose fields
/// are each one declared `Status`. Field attributes:
///
/// - `#[status(default = <expr>)]` — required; the value used when no
///   status file exists yet.
/// - `#[status(representer = "path::to::fn")]` — `fn(&serde_json::Value) ->
///   Result<serde_json::Value, String>` mapping a custom domain value to
///   the persisted subset on dump.
/// - `#[status(constructor = "path::to::fn")]` — `fn(serde_json::Value) ->
///   Result<serde_json::Value, String>` mapping the persisted value back
///   to the custom domain on load.
///
/// # Panics
/// Never panics; malformed input is reported as a compile error.
#[proc_macro_derive(Status, attributes(status))]
pub fn derive_status(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    status::expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
