use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Data, DeriveInput, Fields, FieldsNamed};

pub(crate) fn build(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(ts) => ts.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream> {
    let name = &input.ident;
    let fields = fields_named(input)?;
    let idents = fields.named.iter().filter_map(|f| f.ident.as_ref()).collect::<Vec<_>>();

    let inc_fns = idents.iter().map(|ident| {
        let fn_name = format_ident!("{}_inc", ident);
        quote! {
            #[inline]
            pub fn #fn_name(&self) {
                self.#ident.fetch_add(1, ::std::sync::atomic::Ordering::SeqCst);
            }
        }
    });

    let get_fns = idents.iter().map(|ident| {
        quote! {
            #[inline]
            pub fn #ident(&self) -> usize {
                self.#ident.load(::std::sync::atomic::Ordering::SeqCst)
            }
        }
    });

    let json_items = idents.iter().map(|ident| {
        let key = ident.to_string().replace('_', ".");
        quote!(#key: self.#ident.load(::std::sync::atomic::Ordering::SeqCst),)
    });

    let add_items = idents.iter().map(|ident| {
        quote! {
            self.#ident.fetch_add(
                other.#ident.load(::std::sync::atomic::Ordering::SeqCst),
                ::std::sync::atomic::Ordering::SeqCst,
            );
        }
    });

    let new_items = idents.iter().map(|ident| quote!(#ident: ::std::sync::atomic::AtomicUsize::new(0),));

    let clone_items = idents.iter().map(|ident| {
        quote! {
            #ident: ::std::sync::atomic::AtomicUsize::new(
                self.#ident.load(::std::sync::atomic::Ordering::SeqCst)
            ),
        }
    });

    Ok(quote! {
        impl Clone for #name {
            fn clone(&self) -> Self {
                Self {
                    #(#clone_items)*
                }
            }
        }

        impl #name {
            #[inline]
            pub fn new() -> Self {
                Self {
                    #(#new_items)*
                }
            }

            #(#inc_fns)*

            #(#get_fns)*

            #[inline]
            pub fn to_json(&self) -> serde_json::Value {
                serde_json::json!({
                    #(#json_items)*
                })
            }

            #[inline]
            pub fn add(&self, other: &Self) {
                #(#add_items)*
            }
        }
    })
}

fn fields_named(input: &DeriveInput) -> syn::Result<&FieldsNamed> {
    match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => Ok(fields),
            _ => Err(syn::Error::new_spanned(&input.ident, "Metrics requires named fields")),
        },
        _ => Err(syn::Error::new_spanned(&input.ident, "Metrics can only be derived for structs")),
    }
}
