use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    let version = env!("CARGO_PKG_VERSION");
    if !args.extended {
        println!("castrpc {version}");
        return Ok(SUCCESS);
    }

    println!("name: castrpc");
    println!("version: {version}");
    println!(
        "build_target: {}",
        option_env!("CASTRPC_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "wire: header=id:u16,code:u16 notification_id={:#06x} call_ids=0..{:#06x}",
        castrpc_codec::NOTIFICATION_ID,
        castrpc_codec::CALL_ID_SPACE
    );
    println!(
        "envelope: magic={:?} max_message={}",
        String::from_utf8_lossy(&castrpc_transport::MAGIC),
        castrpc_transport::DEFAULT_MAX_MESSAGE
    );

    Ok(SUCCESS)
}
