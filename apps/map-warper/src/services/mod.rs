pub mod align;
pub mod gcps;
pub mod geotransform;
pub mod lifecycle;
pub mod maps;
pub mod mask;
pub mod publish;
pub mod rectify;
pub mod store;
pub mod tools;
pub mod wms;
