//! `#[obs]`: instrument a quickq function with a tracing span when the
//! consuming crate is built with the `observability` feature.
//!
//! Without arguments the span skips every argument and records at debug
//! level. Arguments are forwarded verbatim to `tracing::instrument`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

#[proc_macro_attribute]
pub fn obs(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item = parse_macro_input!(input as ItemFn);
    if item.sig.asyncness.is_none() {
        return syn::Error::new_spanned(&item.sig.fn_token, "#[obs] only applies to async functions")
            .to_compile_error()
            .into();
    }
    let attr = if args.is_empty() {
        syn::parse_quote!(
            #[cfg_attr(feature = "observability", tracing::instrument(skip_all, level = "debug"))]
        )
    } else {
        let args = proc_macro2::TokenStream::from(args);
        syn::parse_quote!(#[cfg_attr(feature = "observability", tracing::instrument(#args))])
    };
    item.attrs.push(attr);
    TokenStream::from(quote!(#item))
}
