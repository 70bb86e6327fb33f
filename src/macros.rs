/// Macro to simplify creating a work closure for a [`JobSpec`](crate::JobSpec).
///
/// Takes an optional synchronous setup block and a mandatory async logic
/// block, and handles the necessary boxing (`Box::pin`, `async move`).
///
/// # Usage
///
/// ```ignore
/// # use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// # let counter = Arc::new(AtomicUsize::new(0));
/// // With setup block (runs when the closure is called, before the async part):
/// let work_1 = scorekeeper::work_fn! {
///     {
///         let counter = counter.clone();
///     }
///     {
///         counter.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     }
/// };
///
/// // Without setup block:
/// let work_2 = scorekeeper::work_fn! {
///     {
///         tokio::time::sleep(std::time::Duration::from_millis(5)).await;
///         Ok(())
///     }
/// };
/// ```
#[macro_export]
macro_rules! work_fn {
    // Matcher 1: Optional setup block `{...}` followed by the main logic block `{...}`
    (
        { $($setup_stmts:stmt);* $(;)? } // Setup block (optional contents)
        $main_block:block                 // Main logic block
    ) => {
        move || {
            // Execute setup statements
            $($setup_stmts)*

            let fut = async move { $main_block };

            Box::pin(fut) as std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'static>>
        }
    };

    // Matcher 2: Only the main logic block is provided
    (
        $main_block:block // Main logic block
    ) => {
         move || {
            let fut = async move { $main_block };

            Box::pin(fut) as std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'static>>
        }
    };
}
