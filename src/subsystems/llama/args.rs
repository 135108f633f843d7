//! llama-server command line construction.

use crate::config::{FlashAttn, LlamaServerConfig};

/// Build the argument list for one llama-server launch. Optional fields that
/// are unset, and the `-1` / `0` sentinels noted below, emit nothing.
pub fn build_args(cfg: &LlamaServerConfig) -> Vec<String> {
    let mut args = ArgList::default();

    if let Some(model) = &cfg.model_path {
        args.pair("-m", model.display());
    } else if let Some(dir) = &cfg.models_dir {
        args.pair("--models-dir", dir.display());
    }

    args.pair("--host", &cfg.host);
    args.pair("--port", cfg.port);

    args.opt("-c", cfg.ctx_size);
    args.opt("-b", cfg.batch_size);
    args.opt("--ubatch-size", cfg.ubatch_size);
    args.opt("-t", cfg.threads.filter(|&t| t != -1));
    args.opt("--threads-batch", cfg.threads_batch.filter(|&t| t != -1));
    args.opt("-ngl", cfg.gpu_layers.filter(|&n| n != -1));
    args.opt("-mg", cfg.main_gpu.filter(|&g| g != 0));

    args.opt("--temp", cfg.temperature);
    args.opt("--top-k", cfg.top_k);
    args.opt("--top-p", cfg.top_p);
    args.opt("--min-p", cfg.min_p);
    args.opt("--typical-p", cfg.typical_p);
    args.opt("--repeat-last-n", cfg.repeat_last_n);
    args.opt("--repeat-penalty", cfg.repeat_penalty);
    args.opt("--presence-penalty", cfg.presence_penalty);
    args.opt("--frequency-penalty", cfg.frequency_penalty);
    args.opt("--xtc-probability", cfg.xtc_probability);
    args.opt("--xtc-threshold", cfg.xtc_threshold);

    args.opt("--dry-multiplier", cfg.dry_multiplier);
    args.opt("--dry-base", cfg.dry_base);
    args.opt("--dry-allowed-length", cfg.dry_allowed_length);
    args.opt("--dry-penalty-last-n", cfg.dry_penalty_last_n);

    args.opt("-n", cfg.n_predict.filter(|&n| n != -1));
    args.opt("--seed", cfg.seed.filter(|&s| s != -1));

    args.opt("--rope-freq-base", cfg.rope_freq_base);
    args.opt("--rope-freq-scale", cfg.rope_freq_scale);
    args.opt("--yarn-ext-factor", cfg.yarn_ext_factor);
    args.opt("--yarn-attn-factor", cfg.yarn_attn_factor);
    args.opt("--yarn-beta-fast", cfg.yarn_beta_fast);
    args.opt("--yarn-beta-slow", cfg.yarn_beta_slow);
    args.opt("--grp-attn-n", cfg.grp_attn_n);
    args.opt("--grp-attn-w", cfg.grp_attn_w);
    args.opt("--neg-prompt-multiplier", cfg.neg_prompt_multiplier);

    args.opt("--cache-type-k", cfg.cache_type_k.as_deref());
    args.opt("--cache-type-v", cfg.cache_type_v.as_deref());

    match cfg.flash_attn {
        Some(FlashAttn::On) => args.flag("-fa", true),
        Some(FlashAttn::Off) => args.flag("--no-flash-attn", true),
        Some(FlashAttn::Auto) | None => {}
    }

    args.flag("--embedding", cfg.embedding);
    args.flag("--verbose", cfg.verbose);
    args.flag("--penalize-nl", cfg.penalize_nl);
    args.flag("--ignore-eos", cfg.ignore_eos);
    args.flag("--mlock", cfg.mlock);
    args.flag("--numa", cfg.numa);
    args.flag("--memory-mapped", cfg.memory_mapped);
    args.flag("--no-mmap", cfg.use_mmap == Some(false));
    args.flag("--no-kv-offload", cfg.no_kv_offload);

    let mut out = args.0;
    out.extend(cfg.server_args.iter().cloned());
    out
}

#[derive(Default)]
struct ArgList(Vec<String>);

impl ArgList {
    fn pair(&mut self, flag: &str, value: impl std::fmt::Display) {
        self.0.push(flag.to_string());
        self.0.push(value.to_string());
    }

    fn opt<T: std::fmt::Display>(&mut self, flag: &str, value: Option<T>) {
        if let Some(v) = value {
            self.pair(flag, v);
        }
    }

    fn flag(&mut self, flag: &str, on: bool) {
        if on {
            self.0.push(flag.to_string());
        }
    }
}
