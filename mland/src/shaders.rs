// Pre-compiled SPIR-V for the fullscreen pass
//
// The GLSL sources live next to the blobs in src/shaders/.

use ash::util;
use ash::vk;

use crate::{MlandError, Result};

use std::io::Cursor;

/// A shader embedded at build time
pub struct VShader {
    vs_bytes: &'static [u8],
}

pub const VERT_SHADER: VShader = VShader {
    vs_bytes: include_bytes!("./shaders/fill.vert.spv"),
};

pub const FRAG_SHADER: VShader = VShader {
    vs_bytes: include_bytes!("./shaders/fill.frag.spv"),
};

/// Create a vkShaderModule from an embedded shader
///
/// `read_spv` validates alignment and endianness for us, all that is
/// left is handing the words to the driver.
pub(crate) fn create_shader_module(
    dev: &ash::Device,
    shader: &VShader,
) -> Result<vk::ShaderModule> {
    let mut cursor = Cursor::new(shader.vs_bytes);
    let code = util::read_spv(&mut cursor).or(Err(MlandError::INVALID_SHADER))?;

    let info = vk::ShaderModuleCreateInfo::default().code(&code);

    unsafe {
        dev.create_shader_module(&info, None)
            .or(Err(MlandError::INVALID_SHADER))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_shaders_are_valid_spirv() {
        for shader in [&VERT_SHADER, &FRAG_SHADER] {
            let mut cursor = Cursor::new(shader.vs_bytes);
            let words = util::read_spv(&mut cursor).expect("embedded spv must parse");
            assert_eq!(words[0], 0x0723_0203);
        }
    }
}
