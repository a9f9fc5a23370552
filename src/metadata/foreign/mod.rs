//! Read-mostly adapters for foreign on-disk formats: each recognizes its
//! own magic/offset and decodes only the fields the core consumes. None of
//! them support `init_vol2meta` (they never originate a volume, only
//! recognize one) and `save` is a deliberate no-op rather than an error —
//! see DESIGN.md for why.

pub mod geom_mirror;
pub mod geom_stripe;
pub mod md;
pub mod softraid;
