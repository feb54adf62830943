pub mod batch;
pub mod category_tree;
pub mod feed;
pub mod normalize;
pub mod reconciler;
pub mod run;
pub mod service;
