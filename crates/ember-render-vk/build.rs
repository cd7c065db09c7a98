use std::{env, error::Error, fs, path::PathBuf};

// Vertex layout matches pipeline.rs:
//   binding 0, location 0: R32G32B32_SFLOAT (position)
//   binding 0, location 1: R8G8B8A8_UNORM   (color)
const BASIC_VERT: &str = r#"
#version 450
layout(location = 0) in vec3 inPos;
layout(location = 1) in vec4 inColor;

layout(set = 0, binding = 0) uniform Camera { mat4 mvp; } u;

layout(location = 0) out vec4 vColor;

void main() {
    vColor = inColor;
    gl_Position = u.mvp * vec4(inPos, 1.0);
}
"#;

const BASIC_FRAG: &str = r#"
#version 450
layout(location = 0) in vec4 vColor;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vColor;
}
"#;

fn main() -> Result<(), Box<dyn Error>> {
    let out = PathBuf::from(env::var("OUT_DIR")?);

    let compiler = shaderc::Compiler::new()?;
    let mut opts = shaderc::CompileOptions::new()?;
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    for (src, kind, name) in [
        (BASIC_VERT, shaderc::ShaderKind::Vertex, "basic.vert"),
        (BASIC_FRAG, shaderc::ShaderKind::Fragment, "basic.frag"),
    ] {
        let spv = compiler.compile_into_spirv(src, kind, name, "main", Some(&opts))?;
        if spv.get_num_warnings() > 0 {
            println!("cargo:warning={name}: {}", spv.get_warning_messages());
        }
        fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8())?;
    }

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
