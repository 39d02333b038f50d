// Talos common library - main library exports

pub mod messages;
