use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, FnArg, Ident, ItemFn, Pat, Signature, Type};

/// Transform an asynchronous test into a synchronous one, set up logging and
/// inject dependencies.
///
/// Injectable dependencies are `crate::testing::Harness` and
/// [`rocket::local::asynchronous::Client`]. When both are requested the client
/// serves the harness's service. With `#[backend_test(deployed)]` the contract
/// is deployed on the mock ledger before the test runs.
#[proc_macro_attribute]
pub fn backend_test(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(input as ItemFn);

    // Extract type information and reject invalid function signatures.
    let test_args = match check_sig(item_fn.sig.clone()) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    let harness_ctor = match parse_macro_input!(args as Option<Ident>) {
        None => quote! { crate::testing::Harness::new().await },
        Some(arg) if arg == "deployed" => quote! { crate::testing::Harness::deployed().await },
        Some(arg) => {
            return syn::Error::new(arg.span(), "Expected no argument or `deployed`")
                .into_compile_error()
                .into();
        }
    };

    // Rewrite the test function.
    quote! {
        #[test]
        fn #name() {
            /// Test setup.
            async fn setup() -> (crate::testing::Harness, rocket::local::asynchronous::Client) {
                let harness = #harness_ctor;
                let rocket_client = rocket::local::asynchronous::Client::tracked(
                    crate::rocket_for_service(harness.service.clone()),
                )
                .await
                .unwrap();
                (harness, rocket_client)
            }

            /// The test itself.
            #item_fn

            log4rs_test_utils::test_logging::init_logging_once_for(
                ["chainvote_backend"],
                None,
                None,
            );

            let runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("rocket-worker-test-thread")
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                #[allow(unused_variables)]
                let (harness, rocket_client) = setup().await;
                #new_name(#(#test_args),*).await;
            });
        }
    }
    .into()
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject unknown parameters.
fn check_sig(sig: Signature) -> Result<Vec<TokenStream2>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut has_client = false;
    let mut has_harness = false;
    let mut args = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let (Pat::Ident(_), Type::Path(type_path)) = (&*pat_type.pat, &*pat_type.ty) {
                if let Some(type_ident) = type_path.path.get_ident() {
                    if type_ident == "Client" {
                        if has_client {
                            return Err(syn::Error::new(
                                input.span(),
                                "Test cannot accept more than one `rocket::local::asynchronous::Client`",
                            ));
                        }
                        has_client = true;
                        args.push(quote! { rocket_client });
                        continue;
                    } else if type_ident == "Harness" {
                        if has_harness {
                            return Err(syn::Error::new(
                                input.span(),
                                "Test cannot accept more than one `Harness`",
                            ));
                        }
                        has_harness = true;
                        args.push(quote! { harness });
                        continue;
                    }
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `harness_ident: Harness` or `client_ident: Client`",
        ));
    }

    Ok(args)
}
