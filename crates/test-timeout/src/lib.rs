//! Test attributes that fail a test once it exceeds a wall-clock deadline.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(secs = 10, workers = 4)]
//! async fn races_close_against_senders() { /* ... */ }
//!
//! #[test_timeout::timeout(5)]
//! fn spools_to_disk() { /* ... */ }
//! ```
//!
//! The test body runs on a helper thread so a body stuck in a blocking call
//! still reports a timeout instead of hanging the harness.

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct DeadlineArgs {
    secs: u64,
    workers: Option<usize>,
}

impl Parse for DeadlineArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = DeadlineArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            workers: None,
        };

        // Bare literal form: `#[timeout(5)]`.
        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            args.secs = lit.base10_parse()?;
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        while !input.is_empty() {
            let key: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            let value: LitInt = input.parse()?;
            match key.to_string().as_str() {
                "secs" => args.secs = value.base10_parse()?,
                "workers" => args.workers = Some(value.base10_parse()?),
                other => {
                    return Err(syn::Error::new(
                        key.span(),
                        format!("unknown argument `{other}`, expected `secs` or `workers`"),
                    ))
                }
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        if args.secs == 0 {
            return Err(syn::Error::new(
                Span::call_site(),
                "timeout must be greater than zero",
            ));
        }
        if args.workers == Some(0) {
            return Err(syn::Error::new(
                Span::call_site(),
                "workers must be greater than zero",
            ));
        }
        Ok(args)
    }
}

/// Runs an async test on a fresh Tokio runtime under a deadline.
///
/// Without `workers` the runtime is current-thread; with `workers = N` it is
/// multi-threaded with N workers.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as DeadlineArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let builder = match args.workers {
        Some(workers) => quote! {
            tokio::runtime::Builder::new_multi_thread().worker_threads(#workers)
        },
        None => quote! { tokio::runtime::Builder::new_current_thread() },
    };
    let secs = args.secs;
    let body = quote! {
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };
    let harness = deadline_harness(secs, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #harness
        }
    })
}

/// Runs a synchronous test under a deadline.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as DeadlineArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    if args.workers.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "`workers` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let harness = deadline_harness(args.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #harness
        }
    })
}

fn deadline_harness(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                #body
            }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded {}s deadline", #secs)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
