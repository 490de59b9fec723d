use super::ndk::run_in_jvm;
use anyhow::Result;
use jni::objects::{JObjectArray, JString};

/// `Build.SUPPORTED_ABIS`, most preferred first.
pub fn supported_abis() -> Result<Vec<String>> {
    run_in_jvm(|env, _context| {
        let array = env
            .get_static_field("android/os/Build", "SUPPORTED_ABIS", "[Ljava/lang/String;")?
            .l()?;
        let array = JObjectArray::from(array);
        let len = env.get_array_length(&array)?;
        let mut abis = Vec::with_capacity(len as usize);
        for i in 0..len {
            let abi = JString::from(env.get_object_array_element(&array, i)?);
            abis.push(env.get_string(&abi)?.into());
        }
        Ok(abis)
    })
}
