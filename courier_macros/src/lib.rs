mod message;

use proc_macro::TokenStream;

// ============================================================================
// #[derive(Message)] derive macro
// ============================================================================

/// Derive macro for the `Message`, `MessageType` and (optionally) `Command`
/// or `Event` traits.
///
/// # Usage
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize, Message)]
/// #[message(name = "orders.PlaceOrder", command)]
/// struct PlaceOrder {
///     header: MessageHeader,
///     #[serde(skip)]
///     #[message(cancel_token)]
///     token: Option<CancellationToken>,
///     pub sku: String,
/// }
/// ```
///
/// Struct-level `#[message(...)]` keys:
/// - `name = "..."`: the type name used on the wire and in the registry.
///   Defaults to the struct identifier.
/// - `command` / `event`: implements the `Command` / `Event` trait and
///   places the type under the `AnyCommand` / `AnyEvent` family.
/// - `parent = Path`: an extra declared parent (repeatable).
/// - `header = field`: the `MessageHeader` field. Defaults to `header`.
///
/// Field-level `#[message(cancel_token)]` marks a `CancellationToken` or
/// `Option<CancellationToken>` field returned from `Command::cancel_token`.
///
/// Types without `command`, `event` or `parent` sit directly under
/// `AnyMessage`.
#[proc_macro_derive(Message, attributes(message))]
pub fn derive_message(input: TokenStream) -> TokenStream {
    message::derive_message(input)
}
