//! `#[derive(Status)]` expansion.

use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Expr, Fields, Ident, Path, Type};

struct FieldStatus {
    ident: Ident,
    ty: Type,
    default: Expr,
    representer: Option<Path>,
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
                    "Status can only be derived for structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                input,
                "Status can only be derived for structs",
            ))
        }
    };

    let mut parsed = Vec::with_capacity(fields.len());
    for field in fields {
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new_spanned(field, "Status requires named fields"))?;
        parsed.push(parse_field(&ident, &field.ty, &field.attrs)?);
    }

    let spec_ident = format_ident!("__{}_STATUS_SPECS", name);
    let spec_consts: Vec<TokenStream> = parsed
        .iter()
        .map(|f| {
            let name_str = f.ident.to_string();
            quote! { ::labstation_core::meta::StatusSpec { name: #name_str } }
        })
        .collect();

    let defaults_fields: Vec<TokenStream> = parsed
        .iter()
        .map(|f| {
            let ident = &f.ident;
            let default = &f.default;
            quote! { #ident: #default }
        })
        .collect();

    let from_values_stmts: Vec<TokenStream> = parsed.iter().map(from_values_stmt).collect();
    let field_idents: Vec<&Ident> = parsed.iter().map(|f| &f.ident).collect();

    let to_values_stmts: Vec<TokenStream> = parsed.iter().map(to_values_stmt).collect();

    Ok(quote! {
        #[doc(hidden)]
        #[allow(non_upper_case_globals)]
        static #spec_ident: &[::labstation_core::meta::StatusSpec] = &[ #(#spec_consts),* ];

        impl ::labstation_core::meta::StatusSet for #name {
            fn describe() -> &'static [::labstation_core::meta::StatusSpec] {
                #spec_ident
            }

            fn defaults() -> Self {
                Self { #(#defaults_fields),* }
            }

            fn from_values(
                values: ::std::collections::BTreeMap<::std::string::String, ::serde_json::Value>,
            ) -> Self {
                #(#from_values_stmts)*
                Self { #(#field_idents),* }
            }

            fn to_values(
                &self,
            ) -> (
                ::std::collections::BTreeMap<::std::string::String, ::serde_json::Value>,
                ::std::vec::Vec<::labstation_core::error::DescriptorError>,
            ) {
                let mut __values = ::std::collections::BTreeMap::new();
                let mut __errors = ::std::vec::Vec::new();
                #(#to_values_stmts)*
                (__values, __errors)
            }
        }
    })
}

fn parse_field(ident: &Ident, ty: &Type, attrs: &[syn::Attribute]) -> syn::Result<FieldStatus> {
    let mut default = None;
    let mut representer = None;
    let mut constructor = None;

    for attr in attrs {
        if !attr.path().is_ident("status") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("default") {
                let value = meta.value()?;
                default = Some(value.parse()?);
            } else if meta.path.is_ident("representer") {
                let value = meta.value()?;
                let lit: syn::LitStr = value.parse()?;
                representer = Some(lit.parse_with(Path::parse_mod_style)?);
            } else if meta.path.is_ident("constructor") {
                let value = meta.value()?;
                let lit: syn::LitStr = value.parse()?;
                constructor = Some(lit.parse_with(Path::parse_mod_style)?);
            } else {
                return Err(meta.error("unknown `status` attribute key"));
            }
            Ok(())
        })?;
    }

    let default = default.ok_or_else(|| {
        syn::Error::new_spanned(ident, "Status field requires #[status(default = ...)]")
    })?;

    Ok(FieldStatus {
        ident: ident.clone(),
        ty: ty.clone(),
        default,
        representer,
        constructor,
    })
}

fn from_values_stmt(f: &FieldStatus) -> TokenStream {
    let ident = &f.ident;
    let ty = &f.ty;
    let name_str = ident.to_string();
    let default = &f.default;

    let apply_constructor = match &f.constructor {
        Some(path) => quote! {
            match (#path as ::labstation_core::meta::StatusConstructor)(__raw.clone()) {
                Ok(v) => v,
                Err(_) => __raw,
            }
        },
        None => quote! { __raw },
    };

    quote! {
        let #ident: #ty = match values.get(#name_str) {
            Some(__raw) => {
                let __raw = #apply_constructor;
                ::serde_json::from_value(__raw).unwrap_or_else(|_| #default)
            }
            None => #default,
        };
    }
}

fn to_values_stmt(f: &FieldStatus) -> TokenStream {
    let ident = &f.ident;
    let name_str = ident.to_string();

    let represented = match &f.representer {
        Some(path) => quote! {
            match (#path as ::labstation_core::meta::StatusRepresenter)(&__plain) {
                Ok(v) => Some(v),
                Err(__reason) => {
                    __errors.push(::labstation_core::error::DescriptorError::StatusNotRepresentable {
                        module: ::std::string::String::new(),
                        status: #name_str.to_string(),
                        reason: __reason,
                    });
                    None
                }
            }
        },
        None => quote! { Some(__plain) },
    };

    quote! {
        {
            let __plain = ::serde_json::to_value(&self.#ident).unwrap_or(::serde_json::Value::Null);
            if let Some(__final_value) = #represented {
                __values.insert(#name_str.to_string(), __final_value);
            }
        }
    }
}
