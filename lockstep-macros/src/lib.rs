use proc_macro::TokenStream;
use proc_macro_error::{abort, proc_macro_error};
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::{
    parse_macro_input, punctuated::Punctuated, Attribute, FnArg, Ident, ItemFn, Lit, Meta, Pat,
    ReturnType, Signature, Token, Type,
};

const NAME: &str = "name";

/// Marks a function as a parallel routine.
///
/// The first parameter must be the session context. Every other parameter
/// must implement `Default`: workers run the routine with default values and
/// fetch the coordinator's data inside the body with `ctx.share(..)`. The
/// return type must be a `Result` whose error converts from
/// `lockstep::LockstepError` and into `anyhow::Error`.
///
/// Calling the function on the coordinator announces it to every worker and
/// then runs it. Calls made from inside another parallel routine run inline.
///
/// # Attributes
/// - `name`: register under this name instead of the function's.
///
/// # Example
/// ```ignore
/// use lockstep::{parallel, Context};
///
/// #[parallel]
/// fn scale(ctx: &Context, factor: f64) -> anyhow::Result<Vec<f64>> {
///     let factor = ctx.share(factor)?;
///     Ok(local_block(ctx.rank()).iter().map(|x| x * factor).collect())
/// }
///
/// #[parallel(name = "solver::step")]
/// fn step(ctx: &Context) -> anyhow::Result<()> {
///     scale(ctx, 0.5)?;
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
#[proc_macro_error]
pub fn parallel(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attr_args =
        syn::parse::Parser::parse2(Punctuated::<Meta, Token![,]>::parse_terminated, attr.into())
            .unwrap_or_else(|e| abort!(e.span(), "Failed to parse parallel attributes: {}", e));
    let input_fn = parse_macro_input!(item as ItemFn);

    let mut name_override: Option<String> = None;
    for meta in &attr_args {
        match meta {
            Meta::NameValue(nv) if nv.path.is_ident(NAME) => {
                if let syn::Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(lit) = &expr_lit.lit {
                        if lit.value().is_empty() {
                            abort!(lit, "Routine name cannot be empty");
                        }
                        name_override = Some(lit.value());
                        continue;
                    }
                }
                abort!(nv.value, "Expected a string literal for name");
            }
            other => abort!(other, "Unknown parallel attribute; expected `name = \"...\"`"),
        }
    }

    let sig = &input_fn.sig;
    if let Some(asyncness) = &sig.asyncness {
        abort!(asyncness, "Parallel routines cannot be async");
    }
    if let Some(constness) = &sig.constness {
        abort!(constness, "Parallel routines cannot be const");
    }
    if let Some(unsafety) = &sig.unsafety {
        abort!(unsafety, "Parallel routines cannot be unsafe");
    }
    if let Some(variadic) = &sig.variadic {
        abort!(variadic, "Parallel routines cannot be variadic");
    }
    if !sig.generics.params.is_empty() || sig.generics.where_clause.is_some() {
        abort!(
            sig.generics,
            "Parallel routines cannot be generic; workers must know the concrete types"
        );
    }
    check_return_type(sig);

    let mut inputs = sig.inputs.iter();
    let ctx_ident = match inputs.next() {
        Some(FnArg::Typed(pat_type)) if matches!(&*pat_type.ty, Type::Reference(_)) => {
            match &*pat_type.pat {
                Pat::Ident(pat_ident) => pat_ident.ident.clone(),
                other => abort!(other, "The context parameter must be a plain identifier"),
            }
        }
        Some(FnArg::Receiver(receiver)) => {
            abort!(receiver, "Parallel routines must be free functions")
        }
        Some(other) => abort!(other, "First parameter must be the session context: `ctx: &Context`"),
        None => abort!(sig, "Parallel routines take the session context as first parameter"),
    };

    // Parameters after the context: (identifier, type)
    let params: Vec<(Ident, Type)> = inputs
        .map(|arg| match arg {
            FnArg::Typed(pat_type) => {
                let ident = match &*pat_type.pat {
                    Pat::Ident(pat_ident) if pat_ident.subpat.is_none() => pat_ident.ident.clone(),
                    other => abort!(other, "Parameters of parallel routines must be plain identifiers"),
                };
                if let Type::ImplTrait(ty) = &*pat_type.ty {
                    abort!(ty, "`impl Trait` parameters cannot be defaulted on workers");
                }
                (ident, (*pat_type.ty).clone())
            }
            FnArg::Receiver(receiver) => abort!(receiver, "Parallel routines must be free functions"),
        })
        .collect();

    // `r#type` registers as `type`
    let bare_name = sig.ident.unraw();
    let registered_name = name_override.unwrap_or_else(|| bare_name.to_string());
    let arity = params.len();
    let body_name = format_ident!("__lockstep_body_{}", bare_name);
    let entry_name = format_ident!("__lockstep_entry_{}", bare_name);
    let decl_name = format_ident!("__LOCKSTEP_DECL_{}", bare_name.to_string().to_uppercase());

    let cfg_attrs: Vec<&Attribute> = input_fn
        .attrs
        .iter()
        .filter(|attr| attr.path().is_ident("cfg"))
        .collect();
    let wrapper_attrs = &input_fn.attrs;
    let fn_vis = &input_fn.vis;
    let fn_block = &input_fn.block;

    // The body keeps the user's signature, `mut` bindings included.
    let mut body_sig = sig.clone();
    body_sig.ident = body_name.clone();

    // The wrapper only forwards its arguments.
    let mut wrapper_sig = sig.clone();
    for arg in wrapper_sig.inputs.iter_mut() {
        if let FnArg::Typed(pat_type) = arg {
            if let Pat::Ident(pat_ident) = &mut *pat_type.pat {
                pat_ident.mutability = None;
                pat_ident.by_ref = None;
            }
        }
    }

    let arg_names: Vec<&Ident> = params.iter().map(|(ident, _)| ident).collect();
    let arg_defaults = params.iter().map(|(_, ty)| {
        quote! { <#ty as ::core::default::Default>::default() }
    });

    let expanded = quote! {
        #(#wrapper_attrs)*
        #fn_vis #wrapper_sig {
            #ctx_ident.enter(#registered_name, move |__lockstep_ctx| {
                #body_name(__lockstep_ctx, #(#arg_names),*)
            })?
        }

        #(#cfg_attrs)*
        #[doc(hidden)]
        #[allow(clippy::too_many_arguments)]
        #body_sig #fn_block

        #(#cfg_attrs)*
        #[doc(hidden)]
        fn #entry_name(
            __lockstep_ctx: &::lockstep::Context<'_>,
        ) -> ::lockstep::__private::anyhow::Result<()> {
            #body_name(__lockstep_ctx, #(#arg_defaults),*)
                .map(|_| ())
                .map_err(::lockstep::__private::anyhow::Error::from)
        }

        #(#cfg_attrs)*
        #[doc(hidden)]
        #[allow(non_upper_case_globals)]
        #[::lockstep::__private::linkme::distributed_slice(::lockstep::PARALLEL_ROUTINES)]
        #[linkme(crate = ::lockstep::__private::linkme)]
        static #decl_name: ::lockstep::RoutineDecl = ::lockstep::RoutineDecl {
            name: #registered_name,
            arity: #arity,
            module: ::core::module_path!(),
            file: ::core::file!(),
            entry: #entry_name,
        };
    };

    TokenStream::from(expanded)
}

fn check_return_type(sig: &Signature) {
    let ty = match &sig.output {
        ReturnType::Type(_, ty) => ty,
        ReturnType::Default => abort!(
            sig.ident,
            "Parallel routines must return a Result";
            help = "use `-> anyhow::Result<()>`"
        ),
    };
    let is_result = match &**ty {
        Type::Path(tp) => tp
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Result"),
        _ => false,
    };
    if !is_result {
        abort!(ty, "Parallel routines must return a Result");
    }
}
