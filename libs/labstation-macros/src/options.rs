//! `#[derive(Options)]` expansion.

use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Expr, Fields, Ident, Path, Type};

struct FieldOpt {
    ident: Ident,
    ty: Type,
    default: Option<Expr>,
    missing: String,
    checker: Option<Path>,
    constructor: Option<Path>,
}

pub fn expand(input: &DeriveInput) -> syn::Result<TokenStream> {
    let name = &input.ident;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    input,
                    "Options can only be derived for structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                input,
                "Options can only be derived for structs",
            ))
        }
    };

    let mut parsed = Vec::with_capacity(fields.len());
    for field in fields {
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new_spanned(field, "Options requires named fields"))?;
        parsed.push(parse_field(&ident, &field.ty, &field.attrs)?);
    }

    let spec_consts: Vec<TokenStream> = parsed
        .iter()
        .map(|f| {
            let name_str = f.ident.to_string();
            let required = f.default.is_none();
            let missing_variant = missing_policy_variant(&f.missing);
            quote! {
                ::labstation_core::meta::OptionSpec {
                    name: #name_str,
                    required: #required,
                    missing: #missing_variant,
                }
            }
        })
        .collect();

    let spec_ident = format_ident!("__{}_OPTION_SPECS", name);
    let materialize_stmts: Vec<TokenStream> = parsed
        .iter()
        .enumerate()
        .map(|(idx, f)| materialize_stmt(idx, &spec_ident, f))
        .collect();
    let field_idents: Vec<&Ident> = parsed.iter().map(|f| &f.ident).collect();

    Ok(quote! {
        #[doc(hidden)]
        #[allow(non_upper_case_globals)]
        static #spec_ident: &[::labstation_core::meta::OptionSpec] = &[ #(#spec_consts),* ];

        impl ::labstation_core::meta::OptionsSet for #name {
            fn describe() -> &'static [::labstation_core::meta::OptionSpec] {
                #spec_ident
            }

            fn materialize(
                module: &str,
                raw: &::serde_json::Map<::std::string::String, ::serde_json::Value>,
                logger: &::labstation_core::module::ModuleLogger,
            ) -> ::std::result::Result<Self, ::labstation_core::error::DescriptorError> {
                #(#materialize_stmts)*
                Ok(Self { #(#field_idents),* })
            }
        }
    })
}

fn parse_field(ident: &Ident, ty: &Type, attrs: &[syn::Attribute]) -> syn::Result<FieldOpt> {
    let mut default = None;
    let mut missing = "silent".to_string();
    let mut checker = None;
    let mut constructor = None;

    for attr in attrs {
        if !attr.path().is_ident("option") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("default") {
                let value = meta.value()?;
                default = Some(value.parse()?);
            } else if meta.path.is_ident("missing") {
                let value = meta.value()?;
                let lit: syn::LitStr = value.parse()?;
                missing = lit.value();
            } else if meta.path.is_ident("checker") {
                let value = meta.value()?;
                let lit: syn::LitStr = value.parse()?;
                checker = Some(lit.parse_with(Path::parse_mod_style)?);
            } else if meta.path.is_ident("constructor") {
                let value = meta.value()?;
                let lit: syn::LitStr = value.parse()?;
                constructor = Some(lit.parse_with(Path::parse_mod_style)?);
            } else {
                return Err(meta.error("unknown `option` attribute key"));
            }
            Ok(())
        })?;
    }

    Ok(FieldOpt {
        ident: ident.clone(),
        ty: ty.clone(),
        default,
        missing,
        checker,
        constructor,
    })
}

fn missing_policy_variant(s: &str) -> TokenStream {
    match s {
        "info" => quote! { ::labstation_core::meta::MissingPolicy::Info },
        "warn" => quote! { ::labstation_core::meta::MissingPolicy::Warn },
        "error" => quote! { ::labstation_core::meta::MissingPolicy::Error },
        _ => quote! { ::labstation_core::meta::MissingPolicy::Silent },
    }
}

fn materialize_stmt(idx: usize, spec_ident: &Ident, f: &FieldOpt) -> TokenStream {
    let ident = &f.ident;
    let ty = &f.ty;
    let name_str = ident.to_string();

    let default_binding = match &f.default {
        Some(expr) => quote! { let __default = Some(::serde_json::json!(#expr)); },
        None => quote! { let __default: Option<::serde_json::Value> = None; },
    };
    let checker_arg = match &f.checker {
        Some(path) => quote! { Some(#path as ::labstation_core::meta::OptionChecker) },
        None => quote! { None },
    };
    let constructor_arg = match &f.constructor {
        Some(path) => quote! { Some(#path as ::labstation_core::meta::OptionConstructor) },
        None => quote! { None },
    };

    quote! {
        #default_binding
        let __raw_value = ::labstation_core::meta::option::materialize_one(
            module,
            &#spec_ident[#idx],
            raw,
            __default.as_ref(),
            #checker_arg,
            #constructor_arg,
            logger,
        )?;
        let #ident: #ty = ::serde_json::from_value(__raw_value).map_err(|e| {
            ::labstation_core::error::DescriptorError::ConstructorFailed {
                module: module.to_string(),
                option: #name_str.to_string(),
                reason: e.to_string(),
            }
        })?;
    }
}
