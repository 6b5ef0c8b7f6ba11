//! Runtime GLSL compilation for rendergraph.
//!
//! [`ShaderCompiler`] implements [`ShaderProvider`]: it finds a GLSL source
//! through its search paths, compiles it to SPIR-V with shaderc and reflects
//! the descriptor parameters with spirq.

mod reflect;

pub use reflect::reflect_parameters;

use rendergraph_gpu::{CompiledShader, GpuError, Logger, ShaderProvider, ShaderStage};
use shaderc::{CompileOptions, Compiler, EnvVersion, ShaderKind, SpirvVersion, TargetEnv};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShaderError {
    #[error("shaderc compiler is unavailable")]
    CompilerUnavailable,
    #[error("Shader source {source_name:?} not found in {searched:?}")]
    NotFound {
        source_name: String,
        searched: Vec<PathBuf>,
    },
    #[error("IO error reading {path:?}: {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("Compilation of {name} failed: {message}")]
    Compilation { name: String, message: String },
    #[error("Reflection failed: {0}")]
    Reflection(String),
}

impl From<ShaderError> for GpuError {
    fn from(err: ShaderError) -> Self {
        match err {
            ShaderError::Reflection(message) => Self::ShaderReflection(message),
            other => Self::ShaderCompilation(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShaderError>;

/// Vulkan environment the SPIR-V is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShaderTarget {
    Vulkan1_2,
    #[default]
    Vulkan1_3,
}

impl ShaderTarget {
    fn env_version(self) -> EnvVersion {
        match self {
            Self::Vulkan1_2 => EnvVersion::Vulkan1_2,
            Self::Vulkan1_3 => EnvVersion::Vulkan1_3,
        }
    }

    fn spirv_version(self) -> SpirvVersion {
        match self {
            Self::Vulkan1_2 => SpirvVersion::V1_5,
            Self::Vulkan1_3 => SpirvVersion::V1_6,
        }
    }
}

/// Shader compiler configuration.
#[derive(Debug, Clone)]
pub struct ShaderCompilerConfig {
    /// Directories sources and `#include`s are looked up in, in order.
    pub search_paths: Vec<PathBuf>,
    /// Preprocessor definitions as `(name, value)`.
    pub macros: Vec<(String, Option<String>)>,
    pub target: ShaderTarget,
    pub optimize: bool,
}

impl Default for ShaderCompilerConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![PathBuf::from("shaders")],
            macros: Vec::new(),
            target: ShaderTarget::default(),
            optimize: !cfg!(debug_assertions),
        }
    }
}

impl ShaderCompilerConfig {
    pub fn search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    pub fn define(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.macros.push((name.into(), value.map(str::to_string)));
        self
    }
}

/// GLSL to SPIR-V compiler backed by shaderc.
pub struct ShaderCompiler {
    compiler: Compiler,
    config: ShaderCompilerConfig,
    logger: Logger,
}

impl ShaderCompiler {
    pub fn new(config: ShaderCompilerConfig) -> Result<Self> {
        let compiler = Compiler::new().ok_or(ShaderError::CompilerUnavailable)?;
        Ok(Self {
            compiler,
            config,
            logger: Logger::disabled(),
        })
    }

    #[must_use]
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ShaderCompilerConfig {
        &self.config
    }

    /// Find the file for `source` in the search paths.
    pub fn resolve(&self, source: &str, stage: ShaderStage) -> Result<PathBuf> {
        let candidates = candidate_paths(&self.config.search_paths, source, stage);
        candidates
            .iter()
            .find(|path| path.is_file())
            .cloned()
            .ok_or_else(|| ShaderError::NotFound {
                source_name: source.to_string(),
                searched: candidates,
            })
    }

    /// Compile a GLSL source held in memory.
    ///
    /// `name` is used in diagnostics and as the includer's parent name.
    pub fn compile_source(
        &self,
        text: &str,
        name: &str,
        entry_point: &str,
        stage: ShaderStage,
    ) -> Result<CompiledShader> {
        let options = self.options()?;
        let artifact = self
            .compiler
            .compile_into_spirv(text, shader_kind(stage), name, entry_point, Some(&options))
            .map_err(|err| ShaderError::Compilation {
                name: name.to_string(),
                message: err.to_string(),
            })?;

        if artifact.get_num_warnings() > 0 {
            tracing::warn!(
                parent: self.logger.span(),
                shader = name,
                "{}",
                artifact.get_warning_messages()
            );
        }

        let spirv = artifact.as_binary().to_vec();
        let parameters = reflect_parameters(&spirv, entry_point, stage)?;
        tracing::debug!(
            parent: self.logger.span(),
            shader = name,
            words = spirv.len(),
            parameters = parameters.len(),
            "Compiled shader"
        );

        Ok(CompiledShader {
            spirv,
            entry_point: entry_point.to_string(),
            stage,
            parameters,
        })
    }

    /// Load, compile and reflect the shader named by `source`.
    pub fn compile_file(
        &self,
        source: &str,
        entry_point: &str,
        stage: ShaderStage,
    ) -> Result<CompiledShader> {
        let path = self.resolve(source, stage)?;
        let text = std::fs::read_to_string(&path).map_err(|error| ShaderError::Io {
            path: path.clone(),
            error,
        })?;
        self.compile_source(&text, &path.to_string_lossy(), entry_point, stage)
    }

    fn options(&self) -> Result<CompileOptions<'static>> {
        let mut options = CompileOptions::new().ok_or(ShaderError::CompilerUnavailable)?;
        options.set_target_env(TargetEnv::Vulkan, self.config.target.env_version() as u32);
        options.set_target_spirv(self.config.target.spirv_version());
        options.set_optimization_level(if self.config.optimize {
            shaderc::OptimizationLevel::Performance
        } else {
            shaderc::OptimizationLevel::Zero
        });
        options.set_generate_debug_info();
        for (name, value) in &self.config.macros {
            options.add_macro_definition(name, value.as_deref());
        }

        let search_paths = self.config.search_paths.clone();
        options.set_include_callback(move |requested, include_type, requesting, _depth| {
            resolve_include(&search_paths, requested, include_type, requesting)
        });
        Ok(options)
    }
}

impl ShaderProvider for ShaderCompiler {
    fn load_shader(
        &self,
        source: &str,
        entry_point: &str,
        stage: ShaderStage,
    ) -> rendergraph_gpu::Result<CompiledShader> {
        self.compile_file(source, entry_point, stage).map_err(|err| {
            tracing::error!(parent: self.logger.span(), %err, "Shader load failed");
            GpuError::from(err)
        })
    }
}

fn shader_kind(stage: ShaderStage) -> ShaderKind {
    match stage {
        ShaderStage::Vertex => ShaderKind::Vertex,
        ShaderStage::Fragment => ShaderKind::Fragment,
        ShaderStage::Compute => ShaderKind::Compute,
    }
}

/// Paths tried for `source`, in lookup order.
///
/// Absolute sources are tried as given. Each candidate is tried bare, with
/// `.glsl` and with the stage's extension.
fn candidate_paths(search_paths: &[PathBuf], source: &str, stage: ShaderStage) -> Vec<PathBuf> {
    let source = Path::new(source);
    let bases: Vec<PathBuf> = if source.is_absolute() || search_paths.is_empty() {
        vec![source.to_path_buf()]
    } else {
        search_paths.iter().map(|dir| dir.join(source)).collect()
    };

    let mut candidates = Vec::with_capacity(bases.len() * 3);
    for base in bases {
        let mut glsl = base.clone().into_os_string();
        glsl.push(".glsl");
        let mut staged = base.clone().into_os_string();
        staged.push(".");
        staged.push(stage.extension());
        candidates.push(base);
        candidates.push(glsl.into());
        candidates.push(staged.into());
    }
    candidates
}

fn resolve_include(
    search_paths: &[PathBuf],
    requested: &str,
    include_type: shaderc::IncludeType,
    requesting: &str,
) -> shaderc::IncludeCallbackResult {
    let mut dirs = Vec::with_capacity(search_paths.len() + 1);
    if matches!(include_type, shaderc::IncludeType::Relative) {
        if let Some(parent) = Path::new(requesting).parent() {
            dirs.push(parent.to_path_buf());
        }
    }
    dirs.extend(search_paths.iter().cloned());

    for dir in dirs {
        let path = dir.join(requested);
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Ok(shaderc::ResolvedInclude {
                resolved_name: path.to_string_lossy().into_owned(),
                content,
            });
        }
    }
    Err(format!("cannot find include {requested:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendergraph_gpu::vk;

    fn shader_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders")
    }

    #[test]
    fn candidates_cover_extensions_per_search_path() {
        let paths = vec![PathBuf::from("a"), PathBuf::from("b")];
        let candidates = candidate_paths(&paths, "blit", ShaderStage::Fragment);
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("a/blit"),
                PathBuf::from("a/blit.glsl"),
                PathBuf::from("a/blit.frag"),
                PathBuf::from("b/blit"),
                PathBuf::from("b/blit.glsl"),
                PathBuf::from("b/blit.frag"),
            ]
        );
    }

    #[test]
    fn missing_source_lists_searched_paths() {
        let compiler = ShaderCompiler::new(ShaderCompilerConfig {
            search_paths: vec![shader_dir()],
            ..Default::default()
        })
        .unwrap();
        match compiler.resolve("does_not_exist", ShaderStage::Compute) {
            Err(ShaderError::NotFound { searched, .. }) => assert_eq!(searched.len(), 3),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn compiles_and_reflects_copy_shader() {
        let compiler = ShaderCompiler::new(ShaderCompilerConfig {
            search_paths: vec![shader_dir()],
            ..Default::default()
        })
        .unwrap();
        let compiled = compiler
            .load_shader("copy", "main", ShaderStage::Compute)
            .unwrap();

        assert_eq!(compiled.spirv[0], 0x0723_0203, "Invalid SPIR-V magic number");
        assert_eq!(compiled.stage, ShaderStage::Compute);

        let mut params = compiled.parameters.clone();
        params.sort_by_key(|p| (p.set, p.binding));
        assert_eq!(params.len(), 2);
        for (index, param) in params.iter().enumerate() {
            assert_eq!(param.set, 0);
            assert_eq!(param.binding, index as u32);
            assert_eq!(param.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
            assert_eq!(param.stages, vk::ShaderStageFlags::COMPUTE);
        }
    }

    #[test]
    fn merge_shader_reflects_three_storage_buffers() {
        let compiler = ShaderCompiler::new(ShaderCompilerConfig {
            search_paths: vec![shader_dir()],
            ..Default::default()
        })
        .unwrap();
        let compiled = compiler
            .load_shader("merge", "main", ShaderStage::Compute)
            .unwrap();

        let layouts =
            rendergraph_gpu::shader::layouts_from_parameters(&compiled.parameters).unwrap();
        assert_eq!(layouts.len(), 1);
        assert_eq!(layouts[0].len(), 3);
        assert!(layouts[0]
            .iter()
            .all(|b| b.descriptor_type == vk::DescriptorType::STORAGE_BUFFER));
    }

    #[test]
    fn reflects_combined_image_sampler() {
        let compiler = ShaderCompiler::new(ShaderCompilerConfig {
            search_paths: vec![shader_dir()],
            ..Default::default()
        })
        .unwrap();
        let compiled = compiler
            .compile_file("textured", "main", ShaderStage::Fragment)
            .unwrap();
        assert_eq!(compiled.parameters.len(), 1);
        assert_eq!(
            compiled.parameters[0].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(compiled.parameters[0].name.as_deref(), Some("image"));
    }

    #[test]
    fn macros_reach_the_preprocessor() {
        let compiler = ShaderCompiler::new(
            ShaderCompilerConfig::default().define("WORKGROUP", Some("32")),
        )
        .unwrap();
        let source = "#version 450\nlayout(local_size_x = WORKGROUP) in;\nvoid main() {}\n";
        compiler
            .compile_source(source, "inline.comp", "main", ShaderStage::Compute)
            .unwrap();
    }

    #[test]
    fn syntax_errors_become_compilation_errors() {
        let compiler = ShaderCompiler::new(ShaderCompilerConfig::default()).unwrap();
        let err = compiler
            .compile_source("#version 450\nvoid main() {", "broken.comp", "main", ShaderStage::Compute)
            .unwrap_err();
        assert!(matches!(err, ShaderError::Compilation { .. }));
        assert!(matches!(GpuError::from(err), GpuError::ShaderCompilation(_)));
    }
}
