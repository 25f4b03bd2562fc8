mod cli;

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::sync::Arc;
use std::sync::Mutex;

use clap::Parser;
use cli::Cli;
use pond_fs::FileSystem;
use pond_fs::NAME_MAX;
use pond_fs::SECTOR_SIZE;
use pond_fs_fuse::BlockFile;

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    println!("source={:?}\nout_dir={:?}", cli.source, cli.out_dir);

    let block_file = Arc::new(BlockFile(Mutex::new({
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(cli.out_dir.join("fs.img"))?;
        fd.set_len(cli.sectors * SECTOR_SIZE as u64).unwrap();

        fd
    })));

    let fs = FileSystem::format(block_file);
    let root = fs.root_dir();

    for entry in fs::read_dir(&cli.source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .expect("source file name is not valid UTF-8");
        if name.len() > NAME_MAX {
            log::warn!("skip {name:?}: name longer than {NAME_MAX} bytes");
            continue;
        }

        println!("packing: {name:?}");
        let mut host_file = File::open(entry.path())?;
        let mut data: Vec<u8> = Vec::new();
        host_file.read_to_end(&mut data)?;

        fs.create(&root, &name, 0).expect("create failed");
        let file = fs.open_file(&root, &name).expect("open failed");
        assert_eq!(file.write(&data), data.len(), "image full");
    }

    drop(root);
    fs.done();

    Ok(())
}
