use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Ident, LitStr, Path, Type};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Plain,
    Command,
    Event,
}

struct MessageAttrs {
    name: String,
    kind: Kind,
    parents: Vec<Path>,
    header: Ident,
}

pub fn derive_message(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => TokenStream::from(err.to_compile_error()),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let attrs = parse_struct_attrs(input)?;
    let type_name = LitStr::new(&attrs.name, name.span());
    let header = &attrs.header;

    // Declared parents; the family marker comes first so ancestry reads
    // from the most specific family outward.
    let mut parents: Vec<TokenStream2> = Vec::new();
    match attrs.kind {
        Kind::Command => parents.push(quote! { courier::AnyCommand }),
        Kind::Event => parents.push(quote! { courier::AnyEvent }),
        Kind::Plain => {}
    }
    parents.extend(attrs.parents.iter().map(|p| quote! { #p }));
    if parents.is_empty() {
        parents.push(quote! { courier::AnyMessage });
    }

    let kind_impl = match attrs.kind {
        Kind::Command => {
            let token_body = match find_cancel_token(input)? {
                Some((field, true)) => quote! { self.#field.as_ref() },
                Some((field, false)) => quote! { Some(&self.#field) },
                None => quote! { None },
            };
            quote! {
                impl #impl_generics courier::Command for #name #ty_generics #where_clause {
                    fn cancel_token(&self) -> Option<&courier::CancellationToken> {
                        #token_body
                    }
                }
            }
        }
        Kind::Event => quote! {
            impl #impl_generics courier::Event for #name #ty_generics #where_clause {}
        },
        Kind::Plain => {
            if find_cancel_token(input)?.is_some() {
                return Err(syn::Error::new(
                    name.span(),
                    "#[message(cancel_token)] is only meaningful on commands",
                ));
            }
            quote! {}
        }
    };

    Ok(quote! {
        impl #impl_generics courier::MessageType for #name #ty_generics #where_clause {
            const NAME: &'static str = #type_name;

            fn parents() -> Vec<courier::TypeDescriptor> {
                vec![ #( <#parents as courier::MessageType>::descriptor() ),* ]
            }
        }

        impl #impl_generics courier::Message for #name #ty_generics #where_clause {
            fn header(&self) -> &courier::MessageHeader {
                &self.#header
            }

            fn descriptor(&self) -> courier::TypeDescriptor {
                <Self as courier::MessageType>::descriptor()
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn into_any(
                self: ::std::sync::Arc<Self>,
            ) -> ::std::sync::Arc<dyn ::std::any::Any + Send + Sync> {
                self
            }
        }

        #kind_impl
    })
}

fn parse_struct_attrs(input: &DeriveInput) -> syn::Result<MessageAttrs> {
    let mut attrs = MessageAttrs {
        name: input.ident.to_string(),
        kind: Kind::Plain,
        parents: Vec::new(),
        header: format_ident!("header"),
    };

    for attr in &input.attrs {
        if !attr.path().is_ident("message") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.name = value.value();
            } else if meta.path.is_ident("command") {
                set_kind(&mut attrs, Kind::Command, &meta)?;
            } else if meta.path.is_ident("event") {
                set_kind(&mut attrs, Kind::Event, &meta)?;
            } else if meta.path.is_ident("parent") {
                let parent: Path = meta.value()?.parse()?;
                attrs.parents.push(parent);
            } else if meta.path.is_ident("header") {
                let field: Ident = meta.value()?.parse()?;
                attrs.header = field;
            } else {
                return Err(meta.error("unknown message attribute"));
            }
            Ok(())
        })?;
    }

    match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => {
                let has_header = fields
                    .named
                    .iter()
                    .any(|f| f.ident.as_ref() == Some(&attrs.header));
                if !has_header {
                    return Err(syn::Error::new(
                        input.ident.span(),
                        format!("Message derive needs a `{}: MessageHeader` field", attrs.header),
                    ));
                }
            }
            _ => {
                return Err(syn::Error::new(
                    input.ident.span(),
                    "Message derive only supports structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new(
                input.ident.span(),
                "Message derive only supports structs",
            ))
        }
    }

    Ok(attrs)
}

fn set_kind(
    attrs: &mut MessageAttrs,
    kind: Kind,
    meta: &syn::meta::ParseNestedMeta<'_>,
) -> syn::Result<()> {
    if attrs.kind != Kind::Plain && attrs.kind != kind {
        return Err(meta.error("a message cannot be both a command and an event"));
    }
    attrs.kind = kind;
    Ok(())
}

/// Finds the field marked `#[message(cancel_token)]`. The flag is true when
/// the field is an `Option<_>`.
fn find_cancel_token(input: &DeriveInput) -> syn::Result<Option<(Ident, bool)>> {
    let Data::Struct(data) = &input.data else {
        return Ok(None);
    };
    let Fields::Named(fields) = &data.fields else {
        return Ok(None);
    };

    for field in &fields.named {
        for attr in &field.attrs {
            if !attr.path().is_ident("message") {
                continue;
            }
            let mut marked = false;
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("cancel_token") {
                    marked = true;
                    Ok(())
                } else {
                    Err(meta.error("unknown field attribute"))
                }
            })?;
            if marked {
                if let Some(ident) = &field.ident {
                    return Ok(Some((ident.clone(), is_option(&field.ty))));
                }
            }
        }
    }

    Ok(None)
}

fn is_option(ty: &Type) -> bool {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .map(|seg| seg.ident == "Option")
            .unwrap_or(false),
        _ => false,
    }
}
