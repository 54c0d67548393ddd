//! Attribute macros that remove the derive boilerplate from realmload's
//! pipeline types.
//!
//! `Metric` and `Aggregate` both require serde support plus comparison,
//! `Debug` and `Clone`. These macros add the derives (and, for metrics, the
//! marker impl) so a type only has to declare its fields.

use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemStruct, parse_macro_input};

extern crate proc_macro;

/// Derives the traits a per-request sample needs and implements the
/// `Metric` marker trait for it.
///
/// `Metric` must be in scope at the use site.
#[proc_macro_attribute]
pub fn metric(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let name = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialOrd,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast

        impl #impl_generics Metric for #name #ty_generics #where_clause {}
    };

    TokenStream::from(expanded)
}

/// Derives the traits an `Aggregate` implementation needs. The `Aggregate`
/// impl itself is written by hand since it carries the merge logic.
#[proc_macro_attribute]
pub fn aggregate(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialOrd,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast
    };

    TokenStream::from(expanded)
}
