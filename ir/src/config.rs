//! User-facing compilation options.
//!
//! Built explicitly through the bon builder or read from `POLYGPU_*`
//! environment variables.

use bon::bon;

use crate::mapping::{CfgKind, MappingCfg, THREADS_CFG, BLOCKS_CFG};

/// Shared memory available to one block, in bytes.
pub const SHARED_MEMORY_SIZE: usize = 48 * 1024;

/// Shared memory available to matmul kernels, which opt into the larger carve-out.
pub const ADVANCED_SHARED_MEMORY_SIZE: usize = 96 * 1024;

// ============================================================================
// USER CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct UserConfig {
    /// Block extents; derived from the schedule when absent.
    pub block_cfg: Option<MappingCfg>,
    /// Thread extents; derived from the schedule when absent.
    pub thread_cfg: Option<MappingCfg>,
    /// Explicit tile sizes for the outer band, outermost first.
    pub tile_sizes: Option<Vec<i64>>,
    /// Warp layout for matmul kernels, x first.
    pub warp_cfg: Option<Vec<i64>>,

    // Shared memory
    pub use_shared_memory: bool,
    pub shared_memory_size: usize,
    /// Promotion depth; default is one below the block-mapped dimensions.
    pub shared_depth: Option<usize>,
    /// Tensors promoted in addition to the read-only ones.
    pub shared_tensors: Vec<String>,
    /// Pad the innermost buffer dimension straight to 33 when it is below 32.
    pub bank_conflict: bool,
    /// Round the innermost buffer dimension up to this many elements (0: off).
    pub shared_vector_align: usize,
    /// Width of vectorized copy loads in bits (0: off).
    pub vector_load_bits: usize,

    // Mapping
    /// Flatten x, y and z threads into threadIdx.x.
    pub one_dim_thread: bool,
    /// Unroll mapped bands up to this many iterations (1: off).
    pub max_unroll_loop: usize,
    pub stitch_fusion: bool,

    // Reductions
    pub use_reduce_lib: bool,
    pub enable_atomic_add: bool,
    pub enable_tensor_core: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[bon]
impl UserConfig {
    #[builder]
    pub fn new(
        block_cfg: Option<MappingCfg>,
        thread_cfg: Option<MappingCfg>,
        tile_sizes: Option<Vec<i64>>,
        warp_cfg: Option<Vec<i64>>,
        #[builder(default = true)] use_shared_memory: bool,
        #[builder(default = SHARED_MEMORY_SIZE)] shared_memory_size: usize,
        shared_depth: Option<usize>,
        #[builder(default)] shared_tensors: Vec<String>,
        #[builder(default = false)] bank_conflict: bool,
        #[builder(default = 0)] shared_vector_align: usize,
        #[builder(default = 0)] vector_load_bits: usize,
        #[builder(default = false)] one_dim_thread: bool,
        #[builder(default = 1)] max_unroll_loop: usize,
        #[builder(default = false)] stitch_fusion: bool,
        #[builder(default = true)] use_reduce_lib: bool,
        #[builder(default = true)] enable_atomic_add: bool,
        #[builder(default = false)] enable_tensor_core: bool,
    ) -> Self {
        Self {
            block_cfg,
            thread_cfg,
            tile_sizes,
            warp_cfg,
            use_shared_memory,
            shared_memory_size,
            shared_depth,
            shared_tensors,
            bank_conflict,
            shared_vector_align,
            vector_load_bits,
            one_dim_thread,
            max_unroll_loop,
            stitch_fusion,
            use_reduce_lib,
            enable_atomic_add,
            enable_tensor_core,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `POLYGPU_BLOCK_CFG` / `POLYGPU_THREAD_CFG` - Extents, x first (e.g. "256 4")
    /// * `POLYGPU_TILE` - Outer band tile sizes, outermost first
    /// * `POLYGPU_NO_SHARED` - Disable shared memory promotion if set
    /// * `POLYGPU_SHARED_DEPTH` - Promotion depth
    /// * `POLYGPU_SHARED_TENSORS` - Extra promoted tensors, space separated
    /// * `POLYGPU_BANK_CONFLICT` - Bank-conflict padding mode if set
    /// * `POLYGPU_SHARED_VECTOR_ALIGN` - Innermost buffer alignment (default: 0)
    /// * `POLYGPU_VECTOR_LOAD_BITS` - Vectorized copy width (default: 0)
    /// * `POLYGPU_ONE_DIM_THREAD` - Flatten threads into x if set
    /// * `POLYGPU_MAX_UNROLL` - Unroll limit (default: 1)
    /// * `POLYGPU_NO_REDUCE_LIB` - Disable library reductions if set
    pub fn from_env() -> Self {
        let parse_cfg = |var: &str, kind: CfgKind, name: &str| {
            std::env::var(var).ok().and_then(|s| MappingCfg::parse(kind, name, &s).ok())
        };
        let parse_list = |var: &str| {
            std::env::var(var).ok().and_then(|s| s.split_whitespace().map(|v| v.parse().ok()).collect::<Option<Vec<i64>>>())
        };

        Self::builder()
            .maybe_block_cfg(parse_cfg("POLYGPU_BLOCK_CFG", CfgKind::Blocks, BLOCKS_CFG))
            .maybe_thread_cfg(parse_cfg("POLYGPU_THREAD_CFG", CfgKind::Threads, THREADS_CFG))
            .maybe_tile_sizes(parse_list("POLYGPU_TILE"))
            .use_shared_memory(std::env::var("POLYGPU_NO_SHARED").is_err())
            .maybe_shared_depth(std::env::var("POLYGPU_SHARED_DEPTH").ok().and_then(|s| s.parse().ok()))
            .shared_tensors(
                std::env::var("POLYGPU_SHARED_TENSORS")
                    .map(|s| s.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
            )
            .bank_conflict(std::env::var("POLYGPU_BANK_CONFLICT").is_ok())
            .shared_vector_align(std::env::var("POLYGPU_SHARED_VECTOR_ALIGN").ok().and_then(|s| s.parse().ok()).unwrap_or(0))
            .vector_load_bits(std::env::var("POLYGPU_VECTOR_LOAD_BITS").ok().and_then(|s| s.parse().ok()).unwrap_or(0))
            .one_dim_thread(std::env::var("POLYGPU_ONE_DIM_THREAD").is_ok())
            .max_unroll_loop(std::env::var("POLYGPU_MAX_UNROLL").ok().and_then(|s| s.parse().ok()).unwrap_or(1))
            .use_reduce_lib(std::env::var("POLYGPU_NO_REDUCE_LIB").is_err())
            .build()
    }

    /// Whether block/thread configs are derived rather than given.
    pub fn auto_tiling(&self) -> bool {
        self.thread_cfg.is_none() || self.block_cfg.is_none()
    }
}
