//! Resource declarations and the build session that records them.
//!
//! Declaring a resource never contacts the provisioning engine. It only adds
//! an entry to the session's log; the graph builder and scheduler take it
//! from there.

mod context;
mod declaration;
mod id;

pub use context::{BuildContext, DeclarationBuilder};
pub use declaration::{DeclarationClass, Resource, ResourceDeclaration, ResourceOutputs};
pub use id::ResourceId;
