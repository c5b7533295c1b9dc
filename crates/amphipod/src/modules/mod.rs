//! Native capability modules exposed to scripts beyond `kube`: encoding
//! helpers, HTTP access, value structs, and the flow-control builtins.

pub mod encoding;
pub mod http;
pub mod structs;

use starlark::environment::GlobalsBuilder;
use starlark::starlark_module;
use starlark::values::none::NoneType;

/// Register the capability-independent builtins: `struct`, `base64`, `uuid`,
/// `hash`, `sleep` and `error`.
pub fn register(builder: &mut GlobalsBuilder) {
	structs::register(builder);
	encoding::register(builder);
	flow_control(builder);
}

#[starlark_module]
fn flow_control(builder: &mut GlobalsBuilder) {
	/// Block for the given Go-style duration string (`"30s"`, `"5m"`).
	fn sleep(dur: &str) -> anyhow::Result<NoneType> {
		let d = humantime::parse_duration(dur)
			.map_err(|e| anyhow::anyhow!("can not parse duration string `{}': {}", dur, e))?;
		std::thread::sleep(d);
		Ok(NoneType)
	}

	/// Interrupt the current execution with a failure carrying `msg`.
	fn error(msg: &str) -> anyhow::Result<NoneType> {
		Err(anyhow::anyhow!("{}", msg))
	}
}
