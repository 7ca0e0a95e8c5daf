use serde::Serialize;
use serde::de::DeserializeOwned;

/// Binds a job type name to its payload struct.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Split {
///     part: u32,
/// }
///
/// impl Job for Split {
///     const TYPE: &'static str = "demo.split";
/// }
/// ```
///
/// The payload is serialized when submitted and decoded again right before
/// the handler runs, so it must own its data.
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Naming convention: `{namespace}.{action}`, e.g. `etl.split`.
    const TYPE: &'static str;
}
