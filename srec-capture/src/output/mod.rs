//! Output naming, path resolution and disk space checks.

mod disk;
mod filename;
mod resolver;
mod template;

pub use disk::{DiskSpaceProbe, FixedDiskProbe, SysinfoDiskProbe, ensure_disk_space};
pub use filename::sanitize_filename;
pub use resolver::{
    DANMU_EXTENSION, OutputDescriptor, OutputPathResolver, PART_SUFFIX, danmu_path_for,
    strip_part_suffix,
};
pub use template::{TemplateValues, expand_filename_template, expand_folder_template};
