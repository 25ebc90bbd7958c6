//! Certificate document pipeline.
//!
//! locate → stage → fill holder fields → stamp signature → flatten → promote.
//! Everything works on in-memory PDF bytes; persistence goes through
//! [`ObjectStore`] so the generator can be driven entirely from tests.

pub mod flatten;
pub mod form;
pub mod generator;
pub mod locate;
pub mod signature;
pub mod storage;

pub use flatten::{PdftoppmRasterizer, Rasterizer, rebuild_from_pages};
pub use form::{CertificateHolder, fill_holder_fields, read_form_fields};
pub use generator::{CertificateGenerator, GeneratedCertificates};
pub use locate::{CertificateKind, DirectorySource, DocumentSource, LocatedCertificate, locate};
pub use signature::{SignatureRect, stamp_signature};
pub use storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};
